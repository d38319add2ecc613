use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tracing::{info, warn};

use super::retention::{ArchiveStore, LocalStore};
use super::{compare_recency, is_kind, BackupKind, ARCHIVE_EXT};

/// Destructively replaces the live worlds directory with the named archive's
/// contents. The worlds directory is emptied before extraction, so a restore
/// never leaves a mix of old and new state. Returns false when the archive
/// does not exist.
pub async fn restore(backups_dir: &Path, worlds_dir: &Path, name: &str) -> Result<bool> {
    let name = normalize_name(name);
    let archive_path = backups_dir.join(&name);
    if !tokio::fs::try_exists(&archive_path).await.unwrap_or(false) {
        warn!(archive = %name, "restore requested for missing archive");
        return Ok(false);
    }

    let worlds_dir = worlds_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_into(&archive_path, &worlds_dir))
        .await
        .context("restore task failed")?
        .with_context(|| format!("failed to restore {name}"))?;

    info!(archive = %name, "restored archive into worlds directory");
    Ok(true)
}

/// Restores the newest archive across all kinds except `ON_FORCED_STOP`,
/// which is not guaranteed internally consistent and must be named explicitly
/// by an operator. Leaves the current world state untouched when nothing
/// qualifies. Returns the restored archive name, if any.
pub async fn restore_latest(backups_dir: &Path, worlds_dir: &Path) -> Result<Option<String>> {
    let store = LocalStore::new(backups_dir.to_path_buf());
    let names = store.list().await?;
    let Some(newest) = select_latest(&names) else {
        info!("no restorable backups found, keeping current world state");
        return Ok(None);
    };

    restore(backups_dir, worlds_dir, &newest).await?;
    Ok(Some(newest))
}

/// Picks the newest restorable archive name, `ON_FORCED_STOP` excluded.
/// Split out so selection is testable without touching the filesystem.
pub fn select_latest(names: &[String]) -> Option<String> {
    let mut restorable: Vec<String> = names
        .iter()
        .filter(|name| !is_kind(name, BackupKind::OnForcedStop))
        .cloned()
        .collect();
    restorable.sort_by(|a, b| compare_recency(a, b));
    restorable.into_iter().next()
}

fn normalize_name(name: &str) -> String {
    if name.ends_with(ARCHIVE_EXT) {
        name.to_string()
    } else {
        format!("{name}{ARCHIVE_EXT}")
    }
}

fn extract_into(archive_path: &Path, worlds_dir: &PathBuf) -> std::io::Result<()> {
    if worlds_dir.exists() {
        std::fs::remove_dir_all(worlds_dir)?;
    }
    std::fs::create_dir_all(worlds_dir)?;

    let file = std::fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.unpack(worlds_dir)?;
    Ok(())
}
