//! Two-tier key-value cache: a bounded in-memory LRU tier over a durable
//! SQLite-backed disk tier.
//!
//! - Reads probe memory first; disk hits are promoted into memory.
//! - Writes fan out to both tiers.
//! - Each tier evicts against its own count, byte, and age bounds.
//! - Bulk clears on disk stage the content directory in a trash area and
//!   delete it asynchronously, so `remove_all` is constant-time at the
//!   call site.
//!
//! The facade [`TieredCache`] composes the tiers; [`MemoryCache`] and
//! [`DiskCache`] are usable on their own. Background work (auto-trim,
//! trash drain, async siblings) runs on the ambient Tokio runtime; without
//! one, every synchronous operation still works and background features
//! degrade to inline execution.

pub mod disk;
pub mod errors;
pub mod events;
pub mod memory;
pub mod release;
pub mod storage;
pub mod tiered;

pub use disk::{DiskCache, DiskValue, INLINE_THRESHOLD_DEFAULT};
pub use errors::{CacheError, Result};
pub use events::PlatformEvent;
pub use memory::{MemoryCache, MemoryCacheConfig, AUTO_TRIM_INTERVAL_DEFAULT};
pub use release::{BackgroundRelease, InlineRelease, ReleaseExecutor};
pub use storage::{KvStorage, StorageItem, StorageKind};
pub use tiered::TieredCache;
