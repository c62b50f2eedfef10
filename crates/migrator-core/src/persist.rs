//! JSON files that must never be observed half-written: count checkpoints,
//! published assignment lists, run results and the settings file.

use crate::error::{MigrationError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Parse `path`, or `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MigrationError::io_with_path(e, path)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| MigrationError::Json {
            message: format!("{} is not valid: {}", path.display(), e),
            source: Some(e),
        })
}

/// Replace `path` with the pretty-printed `value`.
///
/// The document is staged in a sibling temp file, synced, then renamed over
/// the target. Readers see the previous contents or the new ones.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| MigrationError::io_with_path(e, dir))?;

    let body = serde_json::to_vec_pretty(value)?;
    let mut staged = NamedTempFile::new_in(dir).map_err(|e| MigrationError::io_with_path(e, dir))?;
    staged
        .write_all(&body)
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| MigrationError::io_with_path(e, staged.path()))?;
    staged
        .persist(path)
        .map_err(|e| MigrationError::io_with_path(e.error, path))?;

    debug!("Wrote {} ({} bytes)", path.display(), body.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Cursor {
        space: String,
        last_upload: Option<String>,
    }

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let got: Option<Cursor> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_replacing_a_file_leaves_only_the_target() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cursor.json");
        for upload in ["bafy1", "bafy2"] {
            write_json(
                &path,
                &Cursor {
                    space: "did:key:z6MkSpace".into(),
                    last_upload: Some(upload.into()),
                },
            )
            .unwrap();
        }

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        let got: Cursor = read_json(&path).unwrap().unwrap();
        assert_eq!(got.last_upload.as_deref(), Some("bafy2"));
    }

    #[test]
    fn test_parent_directories_are_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assignments").join("instance-3.json");
        write_json(&path, &["did:mailto:example.com:alice"]).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn test_truncated_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cursor.json");
        fs::write(&path, r#"{"space": "did:key:"#).unwrap();
        assert!(matches!(
            read_json::<Cursor>(&path),
            Err(MigrationError::Json { .. })
        ));
    }
}
