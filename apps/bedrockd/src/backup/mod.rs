pub mod archive;
pub mod manifest;
pub mod restore;
pub mod retention;

use std::cmp::Ordering;
use std::fmt;

pub const ARCHIVE_EXT: &str = ".tar.gz";

/// Category tag fixed at archive-creation time and embedded in the archive name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupKind {
    Scheduled,
    Manual,
    OnStop,
    OnForcedStop,
}

impl BackupKind {
    pub const ALL: [BackupKind; 4] = [
        BackupKind::Scheduled,
        BackupKind::Manual,
        BackupKind::OnStop,
        BackupKind::OnForcedStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Scheduled => "SCHEDULED",
            BackupKind::Manual => "MANUAL",
            BackupKind::OnStop => "ON_STOP",
            BackupKind::OnForcedStop => "ON_FORCED_STOP",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{unixSeconds}_{KIND}.tar.gz`
pub fn archive_name(timestamp: u64, kind: BackupKind) -> String {
    format!("{}_{}{}", timestamp, kind.as_str(), ARCHIVE_EXT)
}

/// Extracts the leading unix timestamp from an archive name, if parsable.
pub fn embedded_timestamp(name: &str) -> Option<u64> {
    name.split('_').next()?.parse().ok()
}

/// Whether the archive name carries the given kind tag.
///
/// `ON_STOP` is a substring of `ON_FORCED_STOP`, so the tag has to be matched
/// against the exact `_{KIND}.tar.gz` suffix rather than with `contains`.
pub fn is_kind(name: &str, kind: BackupKind) -> bool {
    name.ends_with(&format!("_{}{}", kind.as_str(), ARCHIVE_EXT))
        || name.ends_with(&format!("_{}", kind.as_str()))
}

/// Orders archive names newest-first by embedded timestamp. Names with no
/// parsable timestamp sort last, tie-broken by string order.
pub fn compare_recency(a: &str, b: &str) -> Ordering {
    match (embedded_timestamp(a), embedded_timestamp(b)) {
        (Some(ta), Some(tb)) => tb.cmp(&ta).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Out-of-band backup for abrupt termination and forced restores: bypasses
/// manifest negotiation, enumerates the live worlds directory in full, and
/// archives it as `ON_FORCED_STOP`. Such archives are not guaranteed
/// internally consistent and are excluded from automatic restore.
pub async fn unscheduled_backup(
    worlds_dir: &std::path::Path,
    backups_dir: &std::path::Path,
    level_name: &str,
    keep: Option<i64>,
) -> anyhow::Result<String> {
    let worlds = worlds_dir.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || manifest::enumerate_worlds(&worlds)).await??;
    let (_, name) = archive::build_archive(
        worlds_dir,
        backups_dir,
        level_name,
        entries,
        BackupKind::OnForcedStop,
        now_unix_seconds(),
    )
    .await?;
    retention::purge(
        &retention::LocalStore::new(backups_dir.to_path_buf()),
        BackupKind::OnForcedStop,
        keep,
    )
    .await;
    Ok(name)
}

pub fn now_unix_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
