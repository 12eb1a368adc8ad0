//! Durable key-value storage engine.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/manifest.sqlite   relational manifest (plus -wal/-shm siblings)
//! <root>/data/             external payload files
//! <root>/trash/            staged subtrees awaiting asynchronous deletion
//! ```
//!
//! The manifest opens lazily on first use; open failures back off so a
//! broken database never tight-loops. Every operation reports failure as
//! `false` or `None`, logging the underlying cause, so no error escapes a
//! single engine call.

mod files;
mod item;
mod manifest;

pub use item::{StorageItem, StorageKind};

use crate::errors::{CacheError, Result};
use manifest::Manifest;
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;

const MANIFEST_FILE: &str = "manifest.sqlite";
const DATA_DIR: &str = "data";
const TRASH_DIR: &str = "trash";

/// Rows handled per batch during LRU trims and progress-reporting clears.
const EVICT_BATCH: usize = 16;

/// Back-off between manifest open attempts after a failure. Retries
/// continue indefinitely at this rate; the backoff only keeps a broken
/// database from tight-looping.
const OPEN_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_secs(2);

/// Key-value store over a SQLite manifest plus a content directory.
///
/// Not internally synchronised; [`DiskCache`](crate::DiskCache) serialises
/// access with a lock.
pub struct KvStorage {
    root: PathBuf,
    data_dir: PathBuf,
    trash_dir: PathBuf,
    kind: StorageKind,
    db: Option<Manifest>,
    open_failures: u32,
    last_open_failure: Option<Instant>,
    runtime: Option<Handle>,
}

impl KvStorage {
    /// Open or create a store rooted at `root`. Directories are created
    /// eagerly; the manifest itself opens on first use. Leftover trash from
    /// a previous process is drained in the background.
    pub fn open(root: impl Into<PathBuf>, kind: StorageKind) -> Option<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return None;
        }
        let data_dir = root.join(DATA_DIR);
        let trash_dir = root.join(TRASH_DIR);
        for dir in [&root, &data_dir, &trash_dir] {
            if let Err(e) = files::create_dir(dir) {
                tracing::warn!("storage init failed: {e}");
                return None;
            }
        }
        let storage = Self {
            root,
            data_dir,
            trash_dir,
            kind,
            db: None,
            open_failures: 0,
            last_open_failure: None,
            runtime: Handle::try_current().ok(),
        };
        storage.spawn_trash_drain();
        Some(storage)
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// Store one record. For [`StorageKind::File`] a filename is required;
    /// for [`StorageKind::Sqlite`] supplying one is an invalid argument.
    /// Replacing a key retires its previous external file when the
    /// placement changes.
    pub fn save(
        &mut self,
        key: &str,
        value: &[u8],
        filename: Option<&str>,
        extended_data: Option<&[u8]>,
    ) -> bool {
        if key.is_empty() || value.is_empty() {
            return false;
        }
        match (self.kind, filename) {
            (StorageKind::File, None) => return false,
            (StorageKind::Sqlite, Some(_)) => return false,
            _ => {}
        }
        if !self.ensure_open() {
            return false;
        }
        let Some(db) = self.db.as_ref() else {
            return false;
        };
        let previous = match db.filename(key) {
            Ok(found) => found.flatten(),
            Err(e) => {
                tracing::warn!("save failed for '{key}': {e}");
                return false;
            }
        };
        let now = wall_clock();
        let result = match filename {
            Some(name) => files::write_atomic(&self.data_dir, name, value).and_then(|()| {
                db.upsert(key, Some(name), value.len() as u64, None, now, now, extended_data)
            }),
            None => db.upsert(key, None, value.len() as u64, Some(value), now, now, extended_data),
        };
        if let Err(e) = result {
            tracing::warn!("save failed for '{key}': {e}");
            return false;
        }
        if let Some(old) = previous {
            if filename != Some(old.as_str()) {
                if let Err(e) = files::remove(&self.data_dir, &old) {
                    tracing::debug!("stale payload file left behind: {e}");
                }
            }
        }
        true
    }

    /// Fetch one record, payload included. A hit bumps the row's access
    /// timestamp. A row whose external payload file is missing is dropped
    /// and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<StorageItem> {
        if key.is_empty() {
            return None;
        }
        if !self.ensure_open() {
            return None;
        }
        let db = self.db.as_ref()?;
        let mut row = match db.get(key, true) {
            Ok(row) => row?,
            Err(e) => {
                tracing::warn!("get failed for '{key}': {e}");
                return None;
            }
        };
        let value = match &row.filename {
            Some(name) => match files::read(&self.data_dir, name) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    // orphaned row, retire it
                    if let Err(e) = db.delete(key) {
                        tracing::debug!("orphan cleanup failed for '{key}': {e}");
                    }
                    return None;
                }
                Err(e) => {
                    tracing::warn!("get failed for '{key}': {e}");
                    return None;
                }
            },
            None => row.inline_data.take().unwrap_or_default(),
        };
        let now = wall_clock();
        if let Err(e) = db.touch(key, now) {
            tracing::debug!("access-time bump failed for '{key}': {e}");
        }
        Some(StorageItem {
            key: key.to_string(),
            value,
            filename: row.filename,
            size: row.size,
            modification_time: row.modification_time,
            last_access_time: now,
            extended_data: row.extended_data,
        })
    }

    /// Fetch one record's metadata without loading the payload. `size` is
    /// populated from the manifest; `value` comes back empty.
    pub fn get_info(&mut self, key: &str) -> Option<StorageItem> {
        if key.is_empty() {
            return None;
        }
        if !self.ensure_open() {
            return None;
        }
        let db = self.db.as_ref()?;
        let row = match db.get(key, false) {
            Ok(row) => row?,
            Err(e) => {
                tracing::warn!("get_info failed for '{key}': {e}");
                return None;
            }
        };
        Some(StorageItem {
            key: key.to_string(),
            value: Vec::new(),
            filename: row.filename,
            size: row.size,
            modification_time: row.modification_time,
            last_access_time: row.last_access_time,
            extended_data: row.extended_data,
        })
    }

    pub fn exists(&mut self, key: &str) -> bool {
        if key.is_empty() || !self.ensure_open() {
            return false;
        }
        let Some(db) = self.db.as_ref() else {
            return false;
        };
        match db.exists(key) {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!("exists failed for '{key}': {e}");
                false
            }
        }
    }

    /// Delete one record and its external payload file. Removing an absent
    /// key succeeds.
    pub fn remove(&mut self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        if !self.ensure_open() {
            return false;
        }
        let Some(db) = self.db.as_ref() else {
            return false;
        };
        let filename = match db.filename(key) {
            Ok(found) => found.flatten(),
            Err(e) => {
                tracing::warn!("remove failed for '{key}': {e}");
                return false;
            }
        };
        if let Some(name) = filename {
            if let Err(e) = files::remove(&self.data_dir, &name) {
                tracing::warn!("payload delete failed for '{key}': {e}");
            }
        }
        match db.delete(key) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("remove failed for '{key}': {e}");
                false
            }
        }
    }

    /// Delete a batch of records and their external payload files.
    pub fn remove_many(&mut self, keys: &[String]) -> bool {
        if keys.is_empty() {
            return true;
        }
        if !self.ensure_open() {
            return false;
        }
        let Some(db) = self.db.as_ref() else {
            return false;
        };
        for key in keys {
            let filename = match db.filename(key) {
                Ok(found) => found.flatten(),
                Err(e) => {
                    tracing::warn!("batch remove failed: {e}");
                    return false;
                }
            };
            if let Some(name) = filename {
                if let Err(e) = files::remove(&self.data_dir, &name) {
                    tracing::warn!("payload delete failed for '{key}': {e}");
                }
            }
        }
        match db.delete_many(keys) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("batch remove failed: {e}");
                false
            }
        }
    }

    /// Delete every record whose payload is larger than `size` bytes.
    pub fn remove_items_larger_than(&mut self, size: u64) -> bool {
        if !self.ensure_open() {
            return false;
        }
        let Some(db) = self.db.as_ref() else {
            return false;
        };
        let names = match db.filenames_larger_than(size) {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("remove by size failed: {e}");
                return false;
            }
        };
        for name in &names {
            if let Err(e) = files::remove(&self.data_dir, name) {
                tracing::warn!("payload delete failed: {e}");
            }
        }
        match db.delete_larger_than(size) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("remove by size failed: {e}");
                false
            }
        }
    }

    /// Delete every record last accessed before `time` (epoch seconds).
    pub fn remove_items_earlier_than(&mut self, time: i64) -> bool {
        if !self.ensure_open() {
            return false;
        }
        let Some(db) = self.db.as_ref() else {
            return false;
        };
        let names = match db.filenames_earlier_than(time) {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("remove by age failed: {e}");
                return false;
            }
        };
        for name in &names {
            if let Err(e) = files::remove(&self.data_dir, name) {
                tracing::warn!("payload delete failed: {e}");
            }
        }
        match db.delete_earlier_than(time) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("remove by age failed: {e}");
                false
            }
        }
    }

    /// Evict least-recently-accessed records until the payload total is at
    /// most `max_size` bytes.
    pub fn remove_items_to_fit_size(&mut self, max_size: u64) -> bool {
        if max_size == u64::MAX {
            return true;
        }
        if max_size == 0 {
            return self.remove_all();
        }
        loop {
            if !self.ensure_open() {
                return false;
            }
            let Some(db) = self.db.as_ref() else {
                return false;
            };
            let mut total = match db.total_size() {
                Ok(total) => total,
                Err(e) => {
                    tracing::warn!("size trim failed: {e}");
                    return false;
                }
            };
            if total <= max_size {
                return true;
            }
            let batch = match db.oldest(EVICT_BATCH) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!("size trim failed: {e}");
                    return false;
                }
            };
            if batch.is_empty() {
                return true;
            }
            for (key, filename, size) in &batch {
                if total <= max_size {
                    break;
                }
                if let Some(name) = filename {
                    if let Err(e) = files::remove(&self.data_dir, name) {
                        tracing::warn!("payload delete failed for '{key}': {e}");
                    }
                }
                if let Err(e) = db.delete(key) {
                    tracing::warn!("eviction failed for '{key}': {e}");
                    return false;
                }
                total = total.saturating_sub(*size);
            }
        }
    }

    /// Evict least-recently-accessed records until at most `max_count`
    /// remain.
    pub fn remove_items_to_fit_count(&mut self, max_count: u64) -> bool {
        if max_count == u64::MAX {
            return true;
        }
        if max_count == 0 {
            return self.remove_all();
        }
        loop {
            if !self.ensure_open() {
                return false;
            }
            let Some(db) = self.db.as_ref() else {
                return false;
            };
            let count = match db.count() {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!("count trim failed: {e}");
                    return false;
                }
            };
            if count <= max_count {
                return true;
            }
            let excess = (count - max_count).min(EVICT_BATCH as u64);
            if !self.evict_oldest_n(excess as usize) {
                return false;
            }
        }
    }

    /// Clear everything. The data directory is renamed into a UUID-named
    /// trash subtree, an empty one is recreated, the manifest is truncated,
    /// and the trash subtree is deleted asynchronously; the call returns
    /// without waiting for the delete. Falls back to row-by-row deletion
    /// when the rename fails.
    pub fn remove_all(&mut self) -> bool {
        if let Err(e) = files::stash_in_trash(&self.data_dir, &self.trash_dir) {
            tracing::warn!("swap-to-trash failed, clearing row by row: {e}");
            return match self.clear_rows(&mut |_, _| {}) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("fallback clear failed: {e}");
                    false
                }
            };
        }
        if !self.ensure_open() {
            return false;
        }
        let Some(db) = self.db.as_ref() else {
            return false;
        };
        if let Err(e) = db.clear() {
            tracing::warn!("manifest clear failed: {e}");
            return false;
        }
        self.spawn_trash_drain();
        true
    }

    /// Row-by-row clear reporting `(done, total)` after each batch;
    /// `end(failed)` runs at completion.
    pub fn remove_all_with_progress(
        &mut self,
        mut progress: impl FnMut(u64, u64),
        end: impl FnOnce(bool),
    ) {
        match self.clear_rows(&mut progress) {
            Ok(()) => end(false),
            Err(e) => {
                tracing::warn!("progress clear failed: {e}");
                end(true);
            }
        }
    }

    pub fn count(&mut self) -> u64 {
        if !self.ensure_open() {
            return 0;
        }
        let Some(db) = self.db.as_ref() else {
            return 0;
        };
        match db.count() {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("count failed: {e}");
                0
            }
        }
    }

    pub fn total_size(&mut self) -> u64 {
        if !self.ensure_open() {
            return 0;
        }
        let Some(db) = self.db.as_ref() else {
            return 0;
        };
        match db.total_size() {
            Ok(total) => total,
            Err(e) => {
                tracing::warn!("size total failed: {e}");
                0
            }
        }
    }

    /// Close the manifest, finalising its statement cache. The store stays
    /// usable; the next operation reopens.
    pub fn close(&mut self) {
        if let Some(db) = self.db.take() {
            db.close();
        }
    }

    fn evict_oldest_n(&mut self, n: usize) -> bool {
        let Some(db) = self.db.as_ref() else {
            return false;
        };
        let batch = match db.oldest(n) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("eviction scan failed: {e}");
                return false;
            }
        };
        if batch.is_empty() {
            return true;
        }
        for (key, filename, _) in &batch {
            if let Some(name) = filename {
                if let Err(e) = files::remove(&self.data_dir, name) {
                    tracing::warn!("payload delete failed for '{key}': {e}");
                }
            }
            if let Err(e) = db.delete(key) {
                tracing::warn!("eviction failed for '{key}': {e}");
                return false;
            }
        }
        true
    }

    fn clear_rows(&mut self, progress: &mut dyn FnMut(u64, u64)) -> Result<()> {
        if !self.ensure_open() {
            return Err(CacheError::ManifestUnavailable);
        }
        let Some(db) = self.db.as_ref() else {
            return Err(CacheError::ManifestUnavailable);
        };
        let total = db.count()?;
        let mut done = 0u64;
        loop {
            let batch = db.oldest(EVICT_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for (key, filename, _) in &batch {
                if let Some(name) = filename {
                    if let Err(e) = files::remove(&self.data_dir, name) {
                        tracing::debug!("payload delete failed for '{key}': {e}");
                    }
                }
                db.delete(key)?;
                done += 1;
            }
            progress(done, total);
        }
        Ok(())
    }

    /// Lazily open the manifest, backing off after failures.
    fn ensure_open(&mut self) -> bool {
        if self.db.is_some() {
            return true;
        }
        if let Some(at) = self.last_open_failure {
            if at.elapsed() < OPEN_RETRY_BACKOFF {
                return false;
            }
        }
        match Manifest::open(&self.root.join(MANIFEST_FILE)) {
            Ok(db) => {
                self.db = Some(db);
                self.open_failures = 0;
                self.last_open_failure = None;
                true
            }
            Err(e) => {
                self.open_failures += 1;
                self.last_open_failure = Some(Instant::now());
                tracing::warn!(
                    "manifest open failed (attempt {}): {e}",
                    self.open_failures
                );
                false
            }
        }
    }

    fn spawn_trash_drain(&self) {
        let trash = self.trash_dir.clone();
        match &self.runtime {
            Some(handle) => {
                handle.spawn_blocking(move || files::drain_trash(&trash));
            }
            None => files::drain_trash(&trash),
        }
    }
}

impl Drop for KvStorage {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for KvStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStorage")
            .field("root", &self.root)
            .field("kind", &self.kind)
            .field("open", &self.db.is_some())
            .finish()
    }
}

fn wall_clock() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}
