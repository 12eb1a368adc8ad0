//! Serialised on-disk cache tier.
//!
//! A thin wrapper over [`KvStorage`] holding one lock around every engine
//! call. Values at or below the inline threshold live in the manifest;
//! larger ones become external files named by a SHA-256 digest of the key.

use crate::storage::{KvStorage, StorageKind};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default inline threshold: payloads at or below this stay in the
/// manifest.
pub const INLINE_THRESHOLD_DEFAULT: usize = 16 * 1024;

/// Payload bytes plus the optional embedder side-channel persisted next to
/// them. Clones share the underlying buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskValue {
    data: Arc<Vec<u8>>,
    extended_data: Option<Arc<Vec<u8>>>,
}

impl DiskValue {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(data.into()),
            extended_data: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Byte-level cache over a [`KvStorage`] engine.
pub struct DiskCache {
    inner: Arc<DiskInner>,
}

impl Clone for DiskCache {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DiskInner {
    path: PathBuf,
    inline_threshold: usize,
    storage: Mutex<KvStorage>,
}

impl DiskCache {
    /// Open a disk cache rooted at `path` with the default inline
    /// threshold. Returns `None` on invalid input or engine-init failure.
    pub fn new(path: impl Into<PathBuf>) -> Option<Self> {
        Self::with_threshold(path, INLINE_THRESHOLD_DEFAULT)
    }

    /// Open with an explicit threshold. Zero stores every payload
    /// externally, `usize::MAX` stores every payload inline, anything in
    /// between decides per write.
    pub fn with_threshold(path: impl Into<PathBuf>, inline_threshold: usize) -> Option<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return None;
        }
        let kind = match inline_threshold {
            0 => StorageKind::File,
            usize::MAX => StorageKind::Sqlite,
            _ => StorageKind::Mixed,
        };
        let storage = KvStorage::open(&path, kind)?;
        Some(Self {
            inner: Arc::new(DiskInner {
                path,
                inline_threshold,
                storage: Mutex::new(storage),
            }),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.storage.lock().exists(key)
    }

    pub fn get(&self, key: &str) -> Option<DiskValue> {
        let item = self.inner.storage.lock().get(key)?;
        Some(DiskValue {
            data: Arc::new(item.value),
            extended_data: item.extended_data.map(Arc::new),
        })
    }

    pub fn set(&self, key: &str, value: &DiskValue) -> bool {
        let filename = if value.len() > self.inner.inline_threshold {
            Some(filename_for_key(key))
        } else {
            None
        };
        self.inner.storage.lock().save(
            key,
            &value.data,
            filename.as_deref(),
            value.extended_data.as_deref().map(Vec::as_slice),
        )
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.storage.lock().remove(key)
    }

    pub fn remove_all(&self) -> bool {
        self.inner.storage.lock().remove_all()
    }

    /// Row-by-row clear with `(done, total)` progress reports and a final
    /// `end(failed)`.
    pub fn remove_all_with_progress(
        &self,
        progress: impl FnMut(u64, u64),
        end: impl FnOnce(bool),
    ) {
        self.inner.storage.lock().remove_all_with_progress(progress, end);
    }

    pub fn total_count(&self) -> u64 {
        self.inner.storage.lock().count()
    }

    pub fn total_size(&self) -> u64 {
        self.inner.storage.lock().total_size()
    }

    /// Evict least-recently-used entries until at most `count` remain.
    pub fn trim_to_count(&self, count: u64) -> bool {
        self.inner.storage.lock().remove_items_to_fit_count(count)
    }

    /// Evict least-recently-used entries until the payload total fits
    /// `size` bytes.
    pub fn trim_to_size(&self, size: u64) -> bool {
        self.inner.storage.lock().remove_items_to_fit_size(size)
    }

    /// Remove every entry last accessed more than `age` ago.
    pub fn trim_to_age(&self, age: Duration) -> bool {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let cutoff = now.saturating_sub(age.as_secs() as i64);
        self.inner.storage.lock().remove_items_earlier_than(cutoff)
    }

    pub fn inline_threshold(&self) -> usize {
        self.inner.inline_threshold
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Side-channel bytes attached to a value, if any.
    pub fn extended_data(value: &DiskValue) -> Option<&[u8]> {
        value.extended_data.as_deref().map(Vec::as_slice)
    }

    /// Attach (or clear) side-channel bytes on a value before handing it
    /// to [`set`](Self::set). The bytes persist next to the payload and
    /// come back on [`get`](Self::get).
    pub fn set_extended_data(value: &mut DiskValue, data: Option<Vec<u8>>) {
        value.extended_data = data.map(Arc::new);
    }
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("path", &self.inner.path)
            .field("inline_threshold", &self.inner.inline_threshold)
            .finish()
    }
}

/// External payload filename: hex SHA-256 of the key.
fn filename_for_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}
