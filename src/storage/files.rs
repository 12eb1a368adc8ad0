//! Filesystem primitives for the data and trash directories.
//!
//! Writes are atomic (temp file, then rename). Reads treat absence as a
//! miss and deletes treat absence as success, so callers never have to
//! distinguish "already gone".

use crate::errors::{CacheError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub(crate) fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        operation: "create directory",
        source: e,
    })
}

/// Write `data` to `dir/filename` atomically.
pub(crate) fn write_atomic(dir: &Path, filename: &str, data: &[u8]) -> Result<()> {
    let target = dir.join(filename);
    let tmp = dir.join(format!("{filename}.tmp.{}", Uuid::new_v4()));
    fs::write(&tmp, data).map_err(|e| CacheError::Io {
        path: tmp.clone(),
        operation: "write payload file",
        source: e,
    })?;
    match fs::rename(&tmp, &target) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(CacheError::Io {
                path: target,
                operation: "rename payload file",
                source: e,
            })
        }
    }
}

/// Read `dir/filename`; `None` when the file does not exist.
pub(crate) fn read(dir: &Path, filename: &str) -> Result<Option<Vec<u8>>> {
    let path = dir.join(filename);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::Io {
            path,
            operation: "read payload file",
            source: e,
        }),
    }
}

/// Delete `dir/filename`; absence counts as success.
pub(crate) fn remove(dir: &Path, filename: &str) -> Result<()> {
    let path = dir.join(filename);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::Io {
            path,
            operation: "remove payload file",
            source: e,
        }),
    }
}

/// Rename `dir` into a fresh UUID-named subdirectory of `trash` and
/// recreate `dir` empty. Returns the staged subtree.
pub(crate) fn stash_in_trash(dir: &Path, trash: &Path) -> Result<PathBuf> {
    let staged = trash.join(Uuid::new_v4().to_string());
    create_dir(&staged)?;
    fs::rename(dir, staged.join("data")).map_err(|e| CacheError::Io {
        path: dir.to_path_buf(),
        operation: "stage directory in trash",
        source: e,
    })?;
    create_dir(dir)?;
    Ok(staged)
}

/// Recursively delete every staged subtree under `trash`. Failures are
/// logged and left in place for the next drain.
pub(crate) fn drain_trash(trash: &Path) {
    let entries = match fs::read_dir(trash) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        if let Err(e) = fs::remove_dir_all(entry.path()) {
            tracing::debug!("trash drain left '{}': {}", entry.path().display(), e);
        }
    }
}
