use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::warn;

use super::manifest::ManifestEntry;
use super::{archive_name, BackupKind};

/// How many manifest entries are read at once. Entries are independent, so no
/// ordering is guaranteed between them inside the archive.
const READ_CONCURRENCY: usize = 8;

/// Backpressure bound between the readers and the tar writer. One entry's
/// contents is the unit of buffering; the whole world never sits in memory
/// at once.
const WRITE_QUEUE: usize = 4;

/// Builds `{timestamp}_{kind}.tar.gz` in `backups_dir` from the given manifest
/// entries, reading only the flushed prefix of each source file. Entries are
/// streamed into the container as their reads complete. Per-entry failures are
/// logged and skipped; failure to write the container itself is fatal to the
/// attempt.
pub async fn build_archive(
    worlds_dir: &Path,
    backups_dir: &Path,
    level_name: &str,
    entries: Vec<ManifestEntry>,
    kind: BackupKind,
    timestamp: u64,
) -> Result<(PathBuf, String)> {
    let name = archive_name(timestamp, kind);
    let archive_path = backups_dir.join(&name);

    tokio::fs::create_dir_all(backups_dir)
        .await
        .with_context(|| format!("failed to create backups dir {}", backups_dir.display()))?;

    let (tx, rx) = mpsc::channel::<(PathBuf, Vec<u8>)>(WRITE_QUEUE);
    let path_clone = archive_path.clone();
    let writer = tokio::task::spawn_blocking(move || write_container(&path_clone, timestamp, rx));

    stream::iter(entries)
        .map(|entry| {
            let worlds_dir = worlds_dir.to_path_buf();
            let level_name = level_name.to_string();
            let tx = tx.clone();
            async move {
                match read_entry(&worlds_dir, &level_name, &entry).await {
                    // A refused send means the writer already failed; its
                    // error surfaces when the task is joined below.
                    Ok(bytes) => {
                        let _ = tx.send((entry.path, bytes)).await;
                    }
                    Err(err) => {
                        warn!(
                            path = %entry.path.display(),
                            kind = %kind,
                            "skipping backup entry: {err:#}"
                        );
                    }
                }
            }
        })
        .buffer_unordered(READ_CONCURRENCY)
        .collect::<()>()
        .await;
    drop(tx);

    writer
        .await
        .context("archive write task failed")?
        .with_context(|| format!("failed to write archive {name}"))?;

    Ok((archive_path, name))
}

/// Reads the flushed prefix of one manifest entry. Bytes beyond a bounded
/// length are excluded even if the live file has since grown.
async fn read_entry(
    worlds_dir: &Path,
    level_name: &str,
    entry: &ManifestEntry,
) -> Result<Vec<u8>> {
    let source = resolve_source(worlds_dir, level_name, &entry.path)
        .with_context(|| format!("no source file for {}", entry.path.display()))?;
    let file = tokio::fs::File::open(&source)
        .await
        .with_context(|| format!("failed to open {}", source.display()))?;

    let mut bytes = Vec::new();
    match entry.length {
        Some(len) => {
            file.take(len)
                .read_to_end(&mut bytes)
                .await
                .with_context(|| format!("failed to read {}", source.display()))?;
        }
        None => {
            let mut file = file;
            file.read_to_end(&mut bytes)
                .await
                .with_context(|| format!("failed to read {}", source.display()))?;
        }
    }
    Ok(bytes)
}

/// The server is known to report paths missing a directory segment relative
/// to the on-disk layout. Resolution tries the literal path first, then the
/// variant with the level directory inserted, then the variant with the
/// nested `db` directory inserted as well.
pub(crate) fn resolve_source(
    worlds_dir: &Path,
    level_name: &str,
    reported: &Path,
) -> Option<PathBuf> {
    let candidates = [
        worlds_dir.join(reported),
        worlds_dir.join(level_name).join(reported),
        worlds_dir.join(level_name).join("db").join(reported),
    ];
    candidates.into_iter().find(|candidate| candidate.is_file())
}

fn write_container(
    archive_path: &Path,
    timestamp: u64,
    mut entries: mpsc::Receiver<(PathBuf, Vec<u8>)>,
) -> std::io::Result<()> {
    let file = std::fs::File::create(archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar = tar::Builder::new(encoder);

    while let Some((rel, bytes)) = entries.blocking_recv() {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(timestamp);
        header.set_cksum();
        tar.append_data(&mut header, &rel, bytes.as_slice())?;
    }

    tar.into_inner()?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::manifest::ManifestEntry;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::io::Read;

    fn read_archive(path: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let file = std::fs::File::open(path).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        let mut out = BTreeMap::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().into_owned();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            out.insert(path, bytes);
        }
        out
    }

    fn entry(path: &str, length: Option<u64>) -> ManifestEntry {
        ManifestEntry {
            path: PathBuf::from(path),
            length,
        }
    }

    #[tokio::test]
    async fn bounded_length_excludes_bytes_written_after_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let worlds = dir.path().join("worlds");
        std::fs::create_dir_all(worlds.join("level/db")).unwrap();
        // File is longer than the flushed length the server reported.
        std::fs::write(worlds.join("level/db/000001.ldb"), b"flushedEXTRA").unwrap();

        let (path, name) = build_archive(
            &worlds,
            &dir.path().join("backups"),
            "level",
            vec![entry("level/db/000001.ldb", Some(7))],
            BackupKind::Scheduled,
            100,
        )
        .await
        .unwrap();

        assert_eq!(name, "100_SCHEDULED.tar.gz");
        let contents = read_archive(&path);
        assert_eq!(
            contents.get(&PathBuf::from("level/db/000001.ldb")).unwrap(),
            b"flushed"
        );
    }

    #[tokio::test]
    async fn unbounded_length_copies_whole_file_and_zero_copies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let worlds = dir.path().join("worlds");
        std::fs::create_dir_all(worlds.join("level")).unwrap();
        std::fs::write(worlds.join("level/level.dat"), b"whole file").unwrap();
        std::fs::write(worlds.join("level/levelname.txt"), b"level").unwrap();

        let (path, _) = build_archive(
            &worlds,
            &dir.path().join("backups"),
            "level",
            vec![
                entry("level/level.dat", None),
                entry("level/levelname.txt", Some(0)),
            ],
            BackupKind::Manual,
            200,
        )
        .await
        .unwrap();

        let contents = read_archive(&path);
        assert_eq!(contents.get(&PathBuf::from("level/level.dat")).unwrap(), b"whole file");
        assert_eq!(contents.get(&PathBuf::from("level/levelname.txt")).unwrap(), b"");
    }

    #[tokio::test]
    async fn archives_more_entries_than_the_write_queue_holds() {
        let dir = tempfile::tempdir().unwrap();
        let worlds = dir.path().join("worlds");
        std::fs::create_dir_all(worlds.join("level/db")).unwrap();

        let mut entries = Vec::new();
        for n in 0..32 {
            let rel = format!("level/db/{n:06}.ldb");
            std::fs::write(worlds.join(&rel), format!("payload-{n}")).unwrap();
            entries.push(entry(&rel, None));
        }

        let (path, _) = build_archive(
            &worlds,
            &dir.path().join("backups"),
            "level",
            entries,
            BackupKind::Scheduled,
            400,
        )
        .await
        .unwrap();

        let contents = read_archive(&path);
        assert_eq!(contents.len(), 32);
        assert_eq!(
            contents.get(&PathBuf::from("level/db/000031.ldb")).unwrap(),
            b"payload-31"
        );
    }

    #[tokio::test]
    async fn missing_source_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let worlds = dir.path().join("worlds");
        std::fs::create_dir_all(worlds.join("level")).unwrap();
        std::fs::write(worlds.join("level/level.dat"), b"dat").unwrap();

        let (path, _) = build_archive(
            &worlds,
            &dir.path().join("backups"),
            "level",
            vec![
                entry("level/level.dat", Some(3)),
                entry("level/db/does-not-exist.ldb", Some(10)),
            ],
            BackupKind::OnStop,
            300,
        )
        .await
        .unwrap();

        let contents = read_archive(&path);
        assert_eq!(contents.len(), 1);
        assert!(contents.contains_key(&PathBuf::from("level/level.dat")));
    }

    #[test]
    fn resolution_tolerates_missing_directory_segments() {
        let dir = tempfile::tempdir().unwrap();
        let worlds = dir.path().to_path_buf();
        std::fs::create_dir_all(worlds.join("My Level/db")).unwrap();
        std::fs::write(worlds.join("My Level/db/CURRENT"), b"x").unwrap();
        std::fs::write(worlds.join("My Level/level.dat"), b"x").unwrap();

        // Literal path.
        assert_eq!(
            resolve_source(&worlds, "My Level", Path::new("My Level/level.dat")),
            Some(worlds.join("My Level/level.dat"))
        );
        // Reported without the level directory.
        assert_eq!(
            resolve_source(&worlds, "My Level", Path::new("db/CURRENT")),
            Some(worlds.join("My Level/db/CURRENT"))
        );
        // Reported without the level and db directories.
        assert_eq!(
            resolve_source(&worlds, "My Level", Path::new("CURRENT")),
            Some(worlds.join("My Level/db/CURRENT"))
        );
        assert_eq!(resolve_source(&worlds, "My Level", Path::new("nope")), None);
    }
}
