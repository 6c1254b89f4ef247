//! # Atomic file persistence.
//!
//! Two helpers shared by every durable store in the crate:
//!
//! 1. [`atomic_write_json`]: serialize in memory, write to a temp file in the
//!    same directory, fsync, rename over the final path, fsync the parent.
//!    A crash at any point leaves either the old complete file or the new
//!    complete file, never a partial one.
//! 2. [`bounded_read_json`]: check the size on the open handle, cap the read,
//!    then deserialize. An oversized or truncated file is an error, not a panic.
//!
//! Both are blocking; async callers run them on `spawn_blocking`.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Writes `data` to `path` atomically (temp file + fsync + rename).
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    fs::create_dir_all(parent).map_err(|e| StoreError::io("create parent directory", e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StoreError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| StoreError::io("write to temp file", e))?;
    tmp.flush()
        .map_err(|e| StoreError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io("atomic rename to final path", e.error))?;

    fsync_directory(parent)
}

/// Serializes `value` to pretty JSON and writes it atomically to `path`.
///
/// Serialization happens before any file I/O, so a serialization failure
/// never touches the disk.
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(StoreError::Serialize)?;
    atomic_write(path, &json)
}

/// Reads and deserializes a JSON file, refusing files larger than `max_size`.
pub fn bounded_read_json<T: DeserializeOwned>(path: &Path, max_size: u64) -> Result<T, StoreError> {
    let file = File::open(path).map_err(|e| StoreError::io("open file", e))?;
    let size = file
        .metadata()
        .map_err(|e| StoreError::io("fstat after open", e))?
        .len();
    if size > max_size {
        return Err(StoreError::FileTooLarge {
            size,
            max: max_size,
        });
    }

    // `take` keeps the cap even if the file grows after the metadata check.
    let reader = BufReader::new(file.take(max_size));
    serde_json::from_reader(reader).map_err(StoreError::Deserialize)
}

#[cfg(unix)]
fn fsync_directory(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StoreError::io("fsync parent directory", e))
}

#[cfg(not(unix))]
fn fsync_directory(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        name: String,
        n: u32,
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        let doc = Doc {
            name: "a".into(),
            n: 7,
        };

        atomic_write_json(&path, &doc).unwrap();
        let back: Doc = bounded_read_json(&path, 1024).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn oversized_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.json");
        atomic_write(&path, &[b' '; 64]).unwrap();

        let err = bounded_read_json::<Doc>(&path, 16).unwrap_err();
        assert!(matches!(err, StoreError::FileTooLarge { size: 64, max: 16 }));
    }

    #[test]
    fn missing_file_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = bounded_read_json::<Doc>(&dir.path().join("nope.json"), 16).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn truncated_file_is_a_deserialize_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.json");
        atomic_write(&path, br#"{"name": "a", "#).unwrap();

        let err = bounded_read_json::<Doc>(&path, 1024).unwrap_err();
        assert!(matches!(err, StoreError::Deserialize(_)));
    }
}
