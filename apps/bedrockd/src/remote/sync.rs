use std::collections::BTreeSet;
use std::path::Path;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::backup::retention::{purge, ArchiveStore, LocalStore};
use crate::backup::{compare_recency, is_kind, BackupKind};
use crate::config::KeepCounts;

use super::RemoteStore;

/// Uploads a freshly created archive to the remote tier, then bounds the
/// remote set for that kind. Failures here never fail the backup cycle that
/// produced the archive; the local copy is already durable.
pub async fn upload_new(
    remote: &RemoteStore,
    backups_dir: &Path,
    name: &str,
    kind: BackupKind,
    remote_keep: Option<i64>,
) {
    let path = backups_dir.join(name);
    match remote.upload_file(name, &path).await {
        Ok(()) => {
            info!(archive = %name, kind = %kind, bucket = %remote.bucket(), "uploaded archive");
            purge(remote, kind, remote_keep).await;
        }
        Err(err) => {
            warn!(archive = %name, kind = %kind, "failed to upload archive: {err:#}");
        }
    }
}

/// The "should exist locally" set for one kind: the union of local and remote
/// names (duplicates removed), newest-first, truncated to the remote
/// keep-count. Members of that set missing locally are the downloads.
pub fn plan_downloads(
    local: &[String],
    remote: &[String],
    kind: BackupKind,
    keep: Option<i64>,
) -> Vec<String> {
    let union: BTreeSet<String> = local
        .iter()
        .chain(remote.iter())
        .filter(|name| is_kind(name, kind))
        .cloned()
        .collect();

    let mut should_exist: Vec<String> = union.into_iter().collect();
    should_exist.sort_by(|a, b| compare_recency(a, b));
    if let Some(keep) = keep {
        if keep >= 0 {
            should_exist.truncate(keep as usize);
        }
    }

    should_exist
        .into_iter()
        .filter(|name| !local.contains(name))
        .collect()
}

/// Pulls down whatever the remote tier has that the local tier should hold,
/// per kind, then re-enforces local keep-counts (a kind may now be
/// over-represented locally).
pub async fn reconcile_on_startup(
    remote: &RemoteStore,
    backups_dir: &Path,
    remote_keep: &KeepCounts,
    local_keep: &KeepCounts,
) {
    let local_store = LocalStore::new(backups_dir.to_path_buf());
    let local_names = match local_store.list().await {
        Ok(names) => names,
        Err(err) => {
            warn!("failed to list local backups for reconcile: {err:#}");
            return;
        }
    };
    let remote_names = match remote.list().await {
        Ok(names) => names,
        Err(err) => {
            warn!("failed to list remote backups for reconcile: {err:#}");
            return;
        }
    };

    join_all(BackupKind::ALL.iter().map(|&kind| {
        let local_names = &local_names;
        let remote_names = &remote_names;
        async move {
            let wanted = plan_downloads(local_names, remote_names, kind, remote_keep.for_kind(kind));
            for name in wanted {
                match remote.download_to(&name, &backups_dir.join(&name)).await {
                    Ok(()) => info!(archive = %name, kind = %kind, "downloaded remote archive"),
                    Err(err) => {
                        warn!(archive = %name, kind = %kind, "failed to download archive: {err:#}")
                    }
                }
            }
        }
    }))
    .await;

    join_all(
        BackupKind::ALL
            .iter()
            .map(|&kind| purge(&local_store, kind, local_keep.for_kind(kind))),
    )
    .await;
}
