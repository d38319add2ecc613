use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::{compare_recency, is_kind, BackupKind, ARCHIVE_EXT};

/// One tier of archive storage: the local backups directory or the remote
/// bucket. Retention and sync only need listing and deletion.
#[async_trait]
pub trait ArchiveStore {
    fn tier_name(&self) -> &'static str;
    async fn list(&self) -> Result<Vec<String>>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// The local backups directory, all archives flat.
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl ArchiveStore for LocalStore {
    fn tier_name(&self) -> &'static str {
        "local"
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // No backups taken yet.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list backups in {}", self.dir.display()))
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(ARCHIVE_EXT) {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to delete {}", path.display()))
    }
}

/// Computes the deletion candidates for one kind: everything past the first
/// `keep` names in newest-first order. `None` or a negative keep-count means
/// "retain all".
pub fn deletion_candidates(names: &[String], kind: BackupKind, keep: Option<i64>) -> Vec<String> {
    let keep = match keep {
        Some(k) if k >= 0 => k as usize,
        _ => return Vec::new(),
    };
    let mut of_kind: Vec<String> = names
        .iter()
        .filter(|name| is_kind(name, kind))
        .cloned()
        .collect();
    of_kind.sort_by(|a, b| compare_recency(a, b));
    of_kind.split_off(of_kind.len().min(keep))
}

/// Deletes archives of `kind` beyond the keep-count. Per-item deletion is
/// best-effort: one failure never blocks the others, and purge failures never
/// fail the backup cycle that triggered them.
pub async fn purge(store: &dyn ArchiveStore, kind: BackupKind, keep: Option<i64>) {
    let names = match store.list().await {
        Ok(names) => names,
        Err(err) => {
            warn!(tier = store.tier_name(), kind = %kind, "purge listing failed: {err:#}");
            return;
        }
    };

    for name in deletion_candidates(&names, kind, keep) {
        match store.delete(&name).await {
            Ok(()) => info!(tier = store.tier_name(), kind = %kind, archive = %name, "purged archive"),
            Err(err) => {
                warn!(
                    tier = store.tier_name(),
                    kind = %kind,
                    archive = %name,
                    "failed to purge archive: {err:#}"
                );
            }
        }
    }
}
