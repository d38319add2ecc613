use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest instruction: {0:?}")]
    Malformed(String),

    #[error("invalid length in manifest instruction {instruction:?}: {length:?}")]
    InvalidLength { instruction: String, length: String },

    #[error("failed to enumerate world directory {dir}: {source}")]
    Walk {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// One file the server reported as safe to copy: the relative path and the
/// byte length that was durably flushed when the snapshot was taken. `None`
/// means the whole file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub length: Option<u64>,
}

/// Parses the server's raw "files ready" report: comma-space-separated
/// `path:length` instructions. Any malformed instruction fails the whole
/// parse; callers never see a partial manifest.
pub fn parse_manifest(raw: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for instruction in raw.split(", ") {
        let (path, length) = instruction
            .rsplit_once(':')
            .ok_or_else(|| ManifestError::Malformed(instruction.to_string()))?;
        if path.is_empty() {
            return Err(ManifestError::Malformed(instruction.to_string()));
        }
        let length: u64 = length
            .trim()
            .parse()
            .map_err(|_| ManifestError::InvalidLength {
                instruction: instruction.to_string(),
                length: length.to_string(),
            })?;
        entries.push(ManifestEntry {
            path: PathBuf::from(path),
            length: Some(length),
        });
    }
    Ok(entries)
}

/// Enumerates every file under the live worlds directory, assigning each an
/// unbounded length. Used by the forced-stop path, which has no negotiated
/// manifest to work from.
pub fn enumerate_worlds(worlds_dir: &Path) -> Result<Vec<ManifestEntry>, ManifestError> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(worlds_dir).follow_links(false) {
        let entry = entry.map_err(|source| ManifestError::Walk {
            dir: worlds_dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .strip_prefix(worlds_dir)
            .unwrap_or(entry.path())
            .to_path_buf();
        entries.push(ManifestEntry { path, length: None });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_manifest() {
        let raw = "Bedrock level/db/000051.ldb:1281, Bedrock level/db/CURRENT:16, Bedrock level/level.dat:2545";
        let entries = parse_manifest(raw).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, PathBuf::from("Bedrock level/db/000051.ldb"));
        assert_eq!(entries[0].length, Some(1281));
        assert_eq!(entries[2].length, Some(2545));
    }

    #[test]
    fn empty_manifest_is_empty() {
        assert!(parse_manifest("").unwrap().is_empty());
        assert!(parse_manifest("  \r\n").unwrap().is_empty());
    }

    #[test]
    fn missing_separator_fails_whole_parse() {
        let err = parse_manifest("a/db/CURRENT:16, broken-instruction").unwrap_err();
        assert!(matches!(err, ManifestError::Malformed(_)));
    }

    #[test]
    fn non_numeric_length_fails() {
        let err = parse_manifest("a/level.dat:oops").unwrap_err();
        assert!(matches!(err, ManifestError::InvalidLength { .. }));
    }

    #[test]
    fn negative_length_fails() {
        assert!(parse_manifest("a/level.dat:-3").is_err());
    }

    #[test]
    fn zero_length_is_accepted() {
        let entries = parse_manifest("a/level.dat:0").unwrap();
        assert_eq!(entries[0].length, Some(0));
    }

    #[test]
    fn enumeration_assigns_unbounded_lengths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("level/db")).unwrap();
        std::fs::write(dir.path().join("level/level.dat"), b"dat").unwrap();
        std::fs::write(dir.path().join("level/db/CURRENT"), b"cur").unwrap();

        let entries = enumerate_worlds(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.length.is_none()));
        assert!(entries.iter().any(|e| e.path == PathBuf::from("level/db/CURRENT")));
    }
}
