//! Error types for the disk tier and filesystem helpers.
//!
//! These are internal plumbing: no error leaves a single engine call.
//! Public operations report failure as `false` or `None` and log the
//! underlying cause at the failure site.

use std::fmt;
use std::path::PathBuf;

/// Result type for storage-internal operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error raised inside the storage engine or its filesystem helpers.
#[derive(Debug)]
pub enum CacheError {
    /// I/O failure during a filesystem operation.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// The manifest database could not be opened or initialised.
    ManifestOpen {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// A manifest statement failed to prepare or execute.
    Manifest {
        operation: &'static str,
        source: rusqlite::Error,
    },

    /// The manifest is unavailable; a previous open failed and the engine
    /// is backing off before retrying.
    ManifestUnavailable,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io {
                path,
                operation,
                source,
            } => write!(
                f,
                "I/O error during {} on '{}': {}",
                operation,
                path.display(),
                source
            ),
            Self::ManifestOpen { path, source } => {
                write!(f, "failed to open manifest '{}': {}", path.display(), source)
            }
            Self::Manifest { operation, source } => {
                write!(f, "manifest {operation} failed: {source}")
            }
            Self::ManifestUnavailable => {
                write!(f, "manifest unavailable, open is backing off")
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::ManifestOpen { source, .. } | Self::Manifest { source, .. } => Some(source),
            Self::ManifestUnavailable => None,
        }
    }
}
