use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::backup::BackupKind;

/// Backing up more often than this risks the server spending most of its time
/// with writes held.
pub const MIN_FREQUENCY_MINUTES: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_server_root")]
    pub root: PathBuf,
    #[serde(default = "default_level_name")]
    pub level_name: String,
}

impl ServerConfig {
    pub fn executable(&self) -> PathBuf {
        self.root.join("bedrock_server")
    }

    pub fn worlds_dir(&self) -> PathBuf {
        self.root.join("worlds")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupConfig {
    #[serde(default = "default_frequency_minutes")]
    pub frequency_minutes: u64,
    #[serde(default = "default_backups_dir")]
    pub backups_dir: PathBuf,
    #[serde(default)]
    pub local_keep: KeepCounts,
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Per-kind keep-counts for one tier. Missing or negative means retain all.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeepCounts {
    #[serde(default)]
    pub scheduled: Option<i64>,
    #[serde(default)]
    pub manual: Option<i64>,
    #[serde(default)]
    pub on_stop: Option<i64>,
    #[serde(default)]
    pub on_forced_stop: Option<i64>,
}

impl KeepCounts {
    pub fn for_kind(&self, kind: BackupKind) -> Option<i64> {
        match kind {
            BackupKind::Scheduled => self.scheduled,
            BackupKind::Manual => self.manual,
            BackupKind::OnStop => self.on_stop,
            BackupKind::OnForcedStop => self.on_forced_stop,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub keep: KeepCounts,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: default_region(),
            endpoint: None,
            keep: KeepCounts::default(),
        }
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    if config.backup.frequency_minutes < MIN_FREQUENCY_MINUTES {
        bail!(
            "backup.frequency-minutes must be at least {MIN_FREQUENCY_MINUTES}, got {}",
            config.backup.frequency_minutes
        );
    }

    Ok(config)
}

fn default_server_root() -> PathBuf {
    PathBuf::from("./bedrock-server")
}

fn default_level_name() -> String {
    "Bedrock level".to_string()
}

fn default_frequency_minutes() -> u64 {
    30
}

fn default_backups_dir() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_full_config() {
        let (_dir, path) = write_config(
            r#"{
                "server": { "root": "/srv/bedrock", "level-name": "My World" },
                "backup": {
                    "frequency-minutes": 15,
                    "backups-dir": "/srv/backups",
                    "local-keep": { "scheduled": 5, "on-stop": 2 },
                    "remote": {
                        "enabled": true,
                        "region": "eu-west-1",
                        "keep": { "scheduled": 10, "manual": -1 }
                    }
                }
            }"#,
        );
        let config = load(&path).unwrap();
        assert_eq!(config.server.level_name, "My World");
        assert_eq!(config.server.worlds_dir(), PathBuf::from("/srv/bedrock/worlds"));
        assert_eq!(config.backup.frequency_minutes, 15);
        assert_eq!(config.backup.local_keep.for_kind(BackupKind::Scheduled), Some(5));
        assert_eq!(config.backup.local_keep.for_kind(BackupKind::Manual), None);
        assert!(config.backup.remote.enabled);
        assert_eq!(config.backup.remote.keep.for_kind(BackupKind::Manual), Some(-1));
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let (_dir, path) = write_config(r#"{ "server": {}, "backup": {} }"#);
        let config = load(&path).unwrap();
        assert_eq!(config.server.level_name, "Bedrock level");
        assert_eq!(config.backup.frequency_minutes, 30);
        assert!(!config.backup.remote.enabled);
        assert_eq!(config.backup.remote.region, "us-east-1");
    }

    #[test]
    fn rejects_too_frequent_backups() {
        let (_dir, path) =
            write_config(r#"{ "server": {}, "backup": { "frequency-minutes": 5 } }"#);
        assert!(load(&path).is_err());
    }
}
