//! Unified two-tier cache facade.
//!
//! Reads probe the memory tier first and promote disk hits into memory;
//! writes fan out memory-then-disk. Each operation has an asynchronous
//! sibling that runs the synchronous body on the blocking pool and invokes
//! a completion callback.
//!
//! Ordering is per tier: operations serialise on each tier's lock, but two
//! facade calls from different threads may interleave across tiers.
//! Callers needing strict cross-tier linearisation serialise externally.

use crate::disk::{DiskCache, DiskValue, INLINE_THRESHOLD_DEFAULT};
use crate::memory::{MemoryCache, MemoryCacheConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Two-tier cache: a [`MemoryCache`] over a [`DiskCache`] sharing one key
/// space.
pub struct TieredCache {
    inner: Arc<TieredInner>,
}

impl Clone for TieredCache {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct TieredInner {
    name: String,
    memory: MemoryCache<DiskValue>,
    disk: DiskCache,
}

impl TieredCache {
    /// Open a cache rooted under the per-user caches directory joined with
    /// `name`. Returns `None` on invalid input or engine-init failure.
    pub fn by_name(name: &str) -> Option<Self> {
        if name.is_empty() {
            return None;
        }
        let root = dirs::cache_dir()?.join(name);
        Self::by_path(root)
    }

    /// Open a cache rooted at `path`; the cache name is the last path
    /// segment.
    pub fn by_path(path: impl Into<PathBuf>) -> Option<Self> {
        Self::with_config(path, MemoryCacheConfig::default(), INLINE_THRESHOLD_DEFAULT)
    }

    /// Open with an explicit memory configuration and inline threshold.
    pub fn with_config(
        path: impl Into<PathBuf>,
        memory_config: MemoryCacheConfig,
        inline_threshold: usize,
    ) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_string_lossy().into_owned();
        let disk = DiskCache::with_threshold(&path, inline_threshold)?;
        let memory = MemoryCache::new(memory_config);
        Some(Self {
            inner: Arc::new(TieredInner { name, memory, disk }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn memory_cache(&self) -> &MemoryCache<DiskValue> {
        &self.inner.memory
    }

    pub fn disk_cache(&self) -> &DiskCache {
        &self.inner.disk
    }

    /// True when either tier holds the key.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.memory.contains(key) || self.inner.disk.contains(key)
    }

    /// Read through: memory first, then disk. A disk hit is written back
    /// into memory so the next read is memory-resident.
    pub fn get(&self, key: &str) -> Option<DiskValue> {
        if let Some(value) = self.inner.memory.get(key) {
            return Some(value);
        }
        let value = self.inner.disk.get(key)?;
        self.inner
            .memory
            .set(key, value.clone(), value.len() as u64);
        Some(value)
    }

    /// Write through: memory, then disk. The memory cost is the payload
    /// length in bytes. Empty keys and empty values are invalid arguments
    /// and touch neither tier.
    pub fn set(&self, key: &str, value: DiskValue) -> bool {
        if key.is_empty() || value.is_empty() {
            return false;
        }
        self.inner
            .memory
            .set(key, value.clone(), value.len() as u64);
        self.inner.disk.set(key, &value)
    }

    /// Remove from both tiers, memory first.
    pub fn remove(&self, key: &str) {
        self.inner.memory.remove(key);
        self.inner.disk.remove(key);
    }

    /// Clear both tiers, memory first.
    pub fn remove_all(&self) {
        self.inner.memory.remove_all();
        self.inner.disk.remove_all();
    }

    /// Async sibling of [`contains`](Self::contains); the callback
    /// receives the key and the verdict.
    pub fn contains_async<F>(&self, key: impl Into<String>, completion: F)
    where
        F: FnOnce(String, bool) + Send + 'static,
    {
        let cache = self.clone();
        let key = key.into();
        dispatch(move || {
            let present = cache.contains(&key);
            completion(key, present);
        });
    }

    /// Async sibling of [`get`](Self::get); the callback receives the key
    /// and the value, or `None` on a miss.
    pub fn get_async<F>(&self, key: impl Into<String>, completion: F)
    where
        F: FnOnce(String, Option<DiskValue>) + Send + 'static,
    {
        let cache = self.clone();
        let key = key.into();
        dispatch(move || {
            let value = cache.get(&key);
            completion(key, value);
        });
    }

    /// Async sibling of [`set`](Self::set).
    pub fn set_async<F>(&self, key: impl Into<String>, value: DiskValue, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let cache = self.clone();
        let key = key.into();
        dispatch(move || {
            cache.set(&key, value);
            completion();
        });
    }

    /// Async sibling of [`remove`](Self::remove); the callback receives
    /// the key once both tiers dropped it.
    pub fn remove_async<F>(&self, key: impl Into<String>, completion: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        let cache = self.clone();
        let key = key.into();
        dispatch(move || {
            cache.remove(&key);
            completion(key);
        });
    }

    /// Async sibling of [`remove_all`](Self::remove_all).
    pub fn remove_all_async<F>(&self, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let cache = self.clone();
        dispatch(move || {
            cache.remove_all();
            completion();
        });
    }

    /// Clear both tiers, reporting disk progress as `(done, total)` and
    /// finishing with `end(failed)`.
    pub fn remove_all_with_progress<P, E>(&self, progress: P, end: E)
    where
        P: FnMut(u64, u64) + Send + 'static,
        E: FnOnce(bool) + Send + 'static,
    {
        let cache = self.clone();
        dispatch(move || {
            cache.inner.memory.remove_all();
            cache.inner.disk.remove_all_with_progress(progress, end);
        });
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("name", &self.inner.name)
            .field("path", &self.inner.disk.path())
            .finish()
    }
}

/// Run `job` on the blocking pool, or inline when no runtime is present.
fn dispatch(job: impl FnOnce() + Send + 'static) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(job);
        }
        Err(_) => job(),
    }
}
