use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::backup::retention::{purge, LocalStore};
use crate::backup::{archive, manifest, now_unix_seconds, BackupKind};
use crate::config::Config;
use crate::remote::{sync, RemoteStore};

use super::server::ServerHandle;
use super::state::{Phase, SupervisorState};

const READY_PREFIX: &str = "Data saved. Files are now ready to be copied.";

/// Lines the server emits during save negotiation that carry no information
/// the driver acts on. Matched case-insensitively by prefix, in order.
const IGNORED_PREFIXES: &[&str] = &[
    "A previous save has not been completed.",
    "Saving...",
    "Changes to the level are resumed.",
];

#[derive(Debug, PartialEq, Eq)]
pub enum ServerLine<'a> {
    Ignored,
    /// The readiness phrase; anything after it on the same line is the
    /// manifest (may be empty when the manifest follows on the next line).
    SaveReady { manifest: &'a str },
    Passthrough(&'a str),
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    // Slicing by the prefix's byte length can land inside a multibyte
    // character on arbitrary chat output; `get` rejects that instead of
    // panicking.
    line.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Classifies one stdout line from the server.
pub fn classify(line: &str) -> ServerLine<'_> {
    for prefix in IGNORED_PREFIXES {
        if starts_with_ignore_case(line, prefix) {
            return ServerLine::Ignored;
        }
    }
    if starts_with_ignore_case(line, READY_PREFIX) {
        return ServerLine::SaveReady {
            manifest: line[READY_PREFIX.len()..].trim(),
        };
    }
    ServerLine::Passthrough(line)
}

/// Drives the save-negotiation protocol and the backup pipeline behind it.
/// Owned by the control loop; all suspension happens inside its methods.
pub struct Driver {
    config: Config,
    remote: Option<Arc<RemoteStore>>,
    pub state: SupervisorState,
}

impl Driver {
    pub fn new(config: Config, remote: Option<Arc<RemoteStore>>) -> Self {
        Self {
            config,
            remote,
            state: SupervisorState::new(),
        }
    }

    /// Resets negotiation state after the server process is replaced.
    pub fn reset(&mut self) {
        self.state = SupervisorState::new();
    }

    /// Issues `save hold` for a scheduled or manual backup, subject to the
    /// re-entrancy guard.
    pub async fn trigger_backup(
        &mut self,
        server: &mut ServerHandle,
        kind: BackupKind,
    ) -> Result<()> {
        if !self.state.can_request_hold(kind) {
            info!(kind = %kind, "backup already in flight or stop pending, skipping trigger");
            return Ok(());
        }
        info!(kind = %kind, "telling server to prepare for backup");
        self.state.current_kind = Some(kind);
        server.write_line("save hold").await?;
        self.state.phase = Phase::HoldRequested;
        Ok(())
    }

    /// Begins the graceful shutdown sequence: the final `ON_STOP` backup runs
    /// first, and the server is stopped only after it completes. If a cycle
    /// is already in flight, that cycle becomes the final one.
    pub async fn request_graceful_stop(&mut self, server: &mut ServerHandle) -> Result<()> {
        info!("backing up, then stopping the server");
        self.state.stop_requested = true;
        if self.state.can_request_hold(BackupKind::OnStop) {
            self.state.current_kind = Some(BackupKind::OnStop);
            server.write_line("save hold").await?;
            self.state.phase = Phase::HoldRequested;
        }
        Ok(())
    }

    /// Re-polls the server for save readiness while a hold is outstanding.
    /// The server decides when it is safe; no timeout is imposed.
    pub async fn poll_save_query(&mut self, server: &mut ServerHandle) -> Result<()> {
        if matches!(self.state.phase, Phase::HoldRequested | Phase::AwaitingManifest) {
            server.write_line("save query").await?;
        }
        Ok(())
    }

    /// Handles one stdout line. Returns true once a completed backup cycle
    /// should be followed by server shutdown.
    pub async fn handle_server_line(
        &mut self,
        server: &mut ServerHandle,
        line: &str,
    ) -> Result<bool> {
        match classify(line) {
            ServerLine::Ignored => Ok(false),
            ServerLine::SaveReady { manifest } => {
                if !matches!(self.state.phase, Phase::HoldRequested) {
                    warn!("unexpected save readiness outside a hold, ignoring");
                    return Ok(false);
                }
                if manifest.is_empty() {
                    self.state.phase = Phase::AwaitingManifest;
                    Ok(false)
                } else {
                    self.run_backup_cycle(server, manifest).await
                }
            }
            ServerLine::Passthrough(text) => {
                if self.state.phase == Phase::AwaitingManifest {
                    let manifest = text.trim().to_string();
                    self.run_backup_cycle(server, &manifest).await
                } else {
                    info!("[server] {text}");
                    Ok(false)
                }
            }
        }
    }

    /// The archive → local purge → upload → remote purge pipeline, followed
    /// by `save resume`. The server is resumed on every path out of here,
    /// including manifest and container failures; it is never left paused.
    async fn run_backup_cycle(&mut self, server: &mut ServerHandle, raw: &str) -> Result<bool> {
        self.state.phase = Phase::BackingUp;
        let kind = self.state.current_kind.unwrap_or(BackupKind::Manual);
        let timestamp = now_unix_seconds();
        info!(kind = %kind, timestamp, "files ready, creating backup of server state");

        match manifest::parse_manifest(raw) {
            Err(err) => {
                error!(kind = %kind, "aborting backup, bad manifest: {err}");
            }
            Ok(entries) => {
                let worlds_dir = self.config.server.worlds_dir();
                let backups_dir = &self.config.backup.backups_dir;
                match archive::build_archive(
                    &worlds_dir,
                    backups_dir,
                    &self.config.server.level_name,
                    entries,
                    kind,
                    timestamp,
                )
                .await
                {
                    Err(err) => {
                        error!(kind = %kind, "backup attempt failed: {err:#}");
                    }
                    Ok((_, name)) => {
                        info!(archive = %name, kind = %kind, "backup archive created");
                        let local = LocalStore::new(backups_dir.clone());
                        purge(&local, kind, self.config.backup.local_keep.for_kind(kind)).await;
                        if let Some(remote) = &self.remote {
                            sync::upload_new(
                                remote,
                                backups_dir,
                                &name,
                                kind,
                                self.config.backup.remote.keep.for_kind(kind),
                            )
                            .await;
                        }
                    }
                }
            }
        }

        server.write_line("save resume").await?;
        self.state.phase = Phase::Idle;
        self.state.current_kind = None;
        Ok(self.state.stop_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_negotiation_noise_is_ignored() {
        assert_eq!(classify("Saving..."), ServerLine::Ignored);
        assert_eq!(classify("A previous save has not been completed."), ServerLine::Ignored);
        assert_eq!(classify("Changes to the level are resumed."), ServerLine::Ignored);
        assert_eq!(classify("changes to the level are resumed."), ServerLine::Ignored);
    }

    #[test]
    fn readiness_with_inline_manifest() {
        let line = "Data saved. Files are now ready to be copied. level/db/CURRENT:16, level/level.dat:2545\r";
        match classify(line) {
            ServerLine::SaveReady { manifest } => {
                assert_eq!(manifest, "level/db/CURRENT:16, level/level.dat:2545");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn readiness_phrase_alone_yields_empty_manifest() {
        assert_eq!(
            classify("Data saved. Files are now ready to be copied."),
            ServerLine::SaveReady { manifest: "" }
        );
    }

    #[test]
    fn readiness_match_is_case_insensitive() {
        assert!(matches!(
            classify("DATA SAVED. FILES ARE NOW READY TO BE COPIED. a:1"),
            ServerLine::SaveReady { manifest: "a:1" }
        ));
    }

    #[test]
    fn multibyte_chat_near_a_prefix_boundary_passes_through() {
        // "Saving..." is nine bytes; the euro sign here straddles that byte
        // index, which must not break classification.
        let line = "Savingab\u{20ac} ordinary chat";
        assert_eq!(classify(line), ServerLine::Passthrough(line));
        assert_eq!(classify("\u{00e9}"), ServerLine::Passthrough("\u{00e9}"));
    }

    #[test]
    fn ordinary_output_passes_through() {
        assert_eq!(
            classify("[INFO] Player connected: Steve"),
            ServerLine::Passthrough("[INFO] Player connected: Steve")
        );
    }
}
