//! Bounded in-process LRU cache tier.
//!
//! Thread-safe map plus doubly linked access-order list, trimmed against
//! three independent bounds (count, cost, age). Trims use a non-blocking
//! lock protocol so readers are never stalled behind a long eviction loop,
//! and evicted values are destroyed on an injected executor.

mod linked_map;

use crate::events::PlatformEvent;
use crate::release::{default_release, ReleaseExecutor};
use linked_map::LinkedMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Sleep between try-lock attempts while trimming, so readers and writers
/// can interleave with a long eviction pass.
const TRIM_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Default period of the background auto-trim timer.
pub const AUTO_TRIM_INTERVAL_DEFAULT: Duration = Duration::from_secs(5);

/// Callback fired when a platform event reaches the cache.
pub type Observer = Arc<dyn Fn() + Send + Sync>;

/// Configuration for a [`MemoryCache`].
///
/// Limits default to unbounded. `Duration::ZERO` disables the auto-trim
/// timer entirely, which tests use for determinism.
#[derive(Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of resident entries.
    pub count_limit: u64,
    /// Maximum sum of entry costs.
    pub cost_limit: u64,
    /// Maximum time since an entry was last read or written.
    pub age_limit: Duration,
    /// Period of the background trim timer.
    pub auto_trim_interval: Duration,
    /// Clear the cache when the host reports memory pressure.
    pub clear_on_memory_warning: bool,
    /// Clear the cache when the host moves to the background.
    pub clear_on_background: bool,
    /// Fired on memory pressure, before the optional clear.
    pub on_memory_warning: Option<Observer>,
    /// Fired on background transition, before the optional clear.
    pub on_background: Option<Observer>,
    /// Where evicted-value destructors run.
    pub release: Arc<dyn ReleaseExecutor>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            count_limit: u64::MAX,
            cost_limit: u64::MAX,
            age_limit: Duration::MAX,
            auto_trim_interval: AUTO_TRIM_INTERVAL_DEFAULT,
            clear_on_memory_warning: true,
            clear_on_background: true,
            on_memory_warning: None,
            on_background: None,
            release: default_release(),
        }
    }
}

impl MemoryCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_count_limit(mut self, limit: u64) -> Self {
        self.count_limit = limit;
        self
    }

    pub fn with_cost_limit(mut self, limit: u64) -> Self {
        self.cost_limit = limit;
        self
    }

    pub fn with_age_limit(mut self, limit: Duration) -> Self {
        self.age_limit = limit;
        self
    }

    pub fn with_auto_trim_interval(mut self, interval: Duration) -> Self {
        self.auto_trim_interval = interval;
        self
    }

    pub fn with_clear_on_memory_warning(mut self, clear: bool) -> Self {
        self.clear_on_memory_warning = clear;
        self
    }

    pub fn with_clear_on_background(mut self, clear: bool) -> Self {
        self.clear_on_background = clear;
        self
    }

    pub fn with_on_memory_warning(mut self, observer: Observer) -> Self {
        self.on_memory_warning = Some(observer);
        self
    }

    pub fn with_on_background(mut self, observer: Observer) -> Self {
        self.on_background = Some(observer);
        self
    }

    pub fn with_release(mut self, release: Arc<dyn ReleaseExecutor>) -> Self {
        self.release = release;
        self
    }
}

impl fmt::Debug for MemoryCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCacheConfig")
            .field("count_limit", &self.count_limit)
            .field("cost_limit", &self.cost_limit)
            .field("age_limit", &self.age_limit)
            .field("auto_trim_interval", &self.auto_trim_interval)
            .field("clear_on_memory_warning", &self.clear_on_memory_warning)
            .field("clear_on_background", &self.clear_on_background)
            .finish()
    }
}

/// Thread-safe bounded LRU cache over opaque owned values.
pub struct MemoryCache<V> {
    inner: Arc<MemoryInner<V>>,
}

impl<V> Clone for MemoryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct MemoryInner<V> {
    map: Mutex<LinkedMap<V>>,
    config: MemoryCacheConfig,
    auto_trim: Mutex<Option<JoinHandle<()>>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl<V> Drop for MemoryInner<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_trim.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.observer.lock().take() {
            handle.abort();
        }
    }
}

impl<V: Clone + Send + 'static> MemoryCache<V> {
    /// Create a cache and, when a Tokio runtime is present, start its
    /// auto-trim timer.
    pub fn new(config: MemoryCacheConfig) -> Self {
        let cache = Self {
            inner: Arc::new(MemoryInner {
                map: Mutex::new(LinkedMap::new()),
                config,
                auto_trim: Mutex::new(None),
                observer: Mutex::new(None),
            }),
        };
        cache.start_auto_trim();
        cache
    }

    /// Lookup without reordering the access list.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.map.lock().contains(key)
    }

    /// On hit, stamps the access time, promotes the entry to the head and
    /// returns a clone of the value.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut map = self.inner.map.lock();
        map.touch(key).map(|node| node.value.clone())
    }

    /// Insert or replace. The entry lands at the head of the access list.
    ///
    /// A count overflow evicts the tail in-line; a cost overflow schedules
    /// an asynchronous cost trim.
    pub fn set(&self, key: impl Into<String>, value: V, cost: u64) {
        let mut evicted = Vec::new();
        let over_cost;
        {
            let mut map = self.inner.map.lock();
            if let Some(old) = map.insert(key.into(), value, cost) {
                evicted.push(old);
            }
            while map.len() as u64 > self.inner.config.count_limit {
                match map.pop_tail() {
                    Some(node) => evicted.push(node),
                    None => break,
                }
            }
            over_cost = map.total_cost() > self.inner.config.cost_limit;
        }
        if over_cost {
            self.schedule_cost_trim();
        }
        if !evicted.is_empty() {
            self.release(move || drop(evicted));
        }
    }

    /// Remove one entry. Absent keys are ignored.
    pub fn remove(&self, key: &str) {
        let node = self.inner.map.lock().remove(key);
        if let Some(node) = node {
            self.release(move || drop(node));
        }
    }

    /// Detach everything under the lock; destruction happens on the
    /// release executor.
    pub fn remove_all(&self) {
        let map = self.inner.map.lock().take();
        if !map.is_empty() {
            self.release(move || drop(map));
        }
    }

    /// Evict from the tail until at most `count` entries remain.
    pub fn trim_to_count(&self, count: u64) {
        if count == 0 {
            self.remove_all();
            return;
        }
        if self.inner.map.lock().len() as u64 <= count {
            return;
        }
        let mut holder = Vec::new();
        loop {
            match self.inner.map.try_lock() {
                Some(mut map) => {
                    if map.len() as u64 <= count {
                        break;
                    }
                    match map.pop_tail() {
                        Some(node) => holder.push(node),
                        None => break,
                    }
                }
                None => std::thread::sleep(TRIM_RETRY_SLEEP),
            }
        }
        if !holder.is_empty() {
            self.release(move || drop(holder));
        }
    }

    /// Evict from the tail until the cost total is at most `cost`.
    pub fn trim_to_cost(&self, cost: u64) {
        if cost == 0 {
            self.remove_all();
            return;
        }
        if self.inner.map.lock().total_cost() <= cost {
            return;
        }
        let mut holder = Vec::new();
        loop {
            match self.inner.map.try_lock() {
                Some(mut map) => {
                    if map.total_cost() <= cost {
                        break;
                    }
                    match map.pop_tail() {
                        Some(node) => holder.push(node),
                        None => break,
                    }
                }
                None => std::thread::sleep(TRIM_RETRY_SLEEP),
            }
        }
        if !holder.is_empty() {
            self.release(move || drop(holder));
        }
    }

    /// Evict from the tail until no entry has been idle longer than
    /// `max_age`.
    pub fn trim_to_age(&self, max_age: Duration) {
        if max_age == Duration::ZERO {
            self.remove_all();
            return;
        }
        match self.inner.map.lock().tail_accessed() {
            Some(accessed) if accessed.elapsed() > max_age => {}
            _ => return,
        }
        let mut holder = Vec::new();
        loop {
            match self.inner.map.try_lock() {
                Some(mut map) => match map.tail_accessed() {
                    Some(accessed) if accessed.elapsed() > max_age => {
                        match map.pop_tail() {
                            Some(node) => holder.push(node),
                            None => break,
                        }
                    }
                    _ => break,
                },
                None => std::thread::sleep(TRIM_RETRY_SLEEP),
            }
        }
        if !holder.is_empty() {
            self.release(move || drop(holder));
        }
    }

    /// Subscribe to host platform events. Observer callbacks run before
    /// the optional clear. Requires a Tokio runtime.
    pub fn observe_platform_events(&self, mut events: broadcast::Receiver<PlatformEvent>) {
        let Ok(handle) = Handle::try_current() else {
            tracing::debug!("no runtime, platform events not observed");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = MemoryCache { inner };
                match event {
                    PlatformEvent::MemoryPressure => {
                        if let Some(observer) = &cache.inner.config.on_memory_warning {
                            observer();
                        }
                        if cache.inner.config.clear_on_memory_warning {
                            cache.remove_all();
                        }
                    }
                    PlatformEvent::DidEnterBackground => {
                        if let Some(observer) = &cache.inner.config.on_background {
                            observer();
                        }
                        if cache.inner.config.clear_on_background {
                            cache.remove_all();
                        }
                    }
                }
            }
        });
        *self.inner.observer.lock() = Some(task);
    }

    pub fn total_count(&self) -> u64 {
        self.inner.map.lock().len() as u64
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.map.lock().total_cost()
    }

    pub fn count_limit(&self) -> u64 {
        self.inner.config.count_limit
    }

    pub fn cost_limit(&self) -> u64 {
        self.inner.config.cost_limit
    }

    pub fn age_limit(&self) -> Duration {
        self.inner.config.age_limit
    }

    pub fn auto_trim_interval(&self) -> Duration {
        self.inner.config.auto_trim_interval
    }

    /// One auto-trim pass: cost, count, age, in that order.
    fn trim_all(&self) {
        self.trim_to_cost(self.inner.config.cost_limit);
        self.trim_to_count(self.inner.config.count_limit);
        self.trim_to_age(self.inner.config.age_limit);
    }

    fn start_auto_trim(&self) {
        let interval = self.inner.config.auto_trim_interval;
        if interval == Duration::ZERO {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            tracing::debug!("no runtime, auto-trim timer not started");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = MemoryCache { inner };
                let _ = tokio::task::spawn_blocking(move || cache.trim_all()).await;
            }
        });
        *self.inner.auto_trim.lock() = Some(task);
    }

    fn schedule_cost_trim(&self) {
        let limit = self.inner.config.cost_limit;
        let cache = self.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || cache.trim_to_cost(limit));
            }
            Err(_) => cache.trim_to_cost(limit),
        }
    }

    fn release(&self, job: impl FnOnce() + Send + 'static) {
        self.inner.config.release.execute(Box::new(job));
    }
}

impl<V> fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.inner.map.lock();
        f.debug_struct("MemoryCache")
            .field("total_count", &map.len())
            .field("total_cost", &map.total_cost())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::InlineRelease;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn inline_config() -> MemoryCacheConfig {
        MemoryCacheConfig::new()
            .with_auto_trim_interval(Duration::ZERO)
            .with_release(Arc::new(InlineRelease))
    }

    #[test]
    fn round_trip() {
        let cache = MemoryCache::new(inline_config());
        cache.set("k", 41u32, 0);
        assert_eq!(cache.get("k"), Some(41));
        assert!(cache.contains("k"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn trim_to_count_keeps_most_recent_writes() {
        let cache = MemoryCache::new(inline_config());
        for i in 0..5u32 {
            cache.set(format!("k{i}"), i, 1);
        }
        cache.trim_to_count(2);
        assert_eq!(cache.total_count(), 2);
        assert!(cache.contains("k3"));
        assert!(cache.contains("k4"));
        assert!(!cache.contains("k0"));
    }

    #[test]
    fn get_promotes_before_trim() {
        let cache = MemoryCache::new(inline_config());
        cache.set("a", 1u32, 1);
        cache.set("b", 2u32, 1);
        cache.set("c", 3u32, 1);
        cache.get("a");
        cache.trim_to_count(2);
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn count_limit_evicts_tail_inline() {
        let config = inline_config().with_count_limit(2);
        let cache = MemoryCache::new(config);
        cache.set("a", 1u32, 0);
        cache.set("b", 2u32, 0);
        cache.set("c", 3u32, 0);
        assert_eq!(cache.total_count(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn cost_limit_trims_without_runtime() {
        // no runtime: the scheduled cost trim runs inline
        let config = inline_config().with_cost_limit(10);
        let cache = MemoryCache::new(config);
        cache.set("x", 1u32, 6);
        cache.set("y", 2u32, 6);
        assert!(cache.total_cost() <= 10);
        assert!(cache.contains("y"));
        assert!(!cache.contains("x"));
    }

    #[test]
    fn trim_to_cost_stops_at_bound() {
        let cache = MemoryCache::new(inline_config());
        cache.set("a", 1u32, 4);
        cache.set("b", 2u32, 4);
        cache.set("c", 3u32, 4);
        cache.trim_to_cost(8);
        assert_eq!(cache.total_cost(), 8);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn trim_to_age_drops_idle_entries() {
        let cache = MemoryCache::new(inline_config());
        cache.set("old", 1u32, 0);
        std::thread::sleep(Duration::from_millis(60));
        cache.set("fresh", 2u32, 0);
        cache.trim_to_age(Duration::from_millis(30));
        assert!(!cache.contains("old"));
        assert!(cache.contains("fresh"));
    }

    #[test]
    fn zero_limits_clear_everything() {
        let cache = MemoryCache::new(inline_config());
        cache.set("a", 1u32, 1);
        cache.set("b", 2u32, 1);
        cache.trim_to_cost(0);
        assert_eq!(cache.total_count(), 0);
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = MemoryCache::new(inline_config());
        cache.set("k", 1u32, 1);
        cache.remove("k");
        cache.remove("k");
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn remove_all_releases_on_executor() {
        struct Counting(AtomicUsize);
        impl ReleaseExecutor for Counting {
            fn execute(&self, job: Box<dyn FnOnce() + Send>) {
                self.0.fetch_add(1, Ordering::SeqCst);
                job();
            }
        }
        let executor = Arc::new(Counting(AtomicUsize::new(0)));
        let config = inline_config().with_release(executor.clone());
        let cache = MemoryCache::new(config);
        cache.set("a", 1u32, 0);
        cache.set("b", 2u32, 0);
        cache.remove_all();
        assert_eq!(cache.total_count(), 0);
        assert_eq!(executor.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_trim_enforces_age_limit() {
        let config = MemoryCacheConfig::new()
            .with_age_limit(Duration::from_millis(50))
            .with_auto_trim_interval(Duration::from_millis(20))
            .with_release(Arc::new(InlineRelease));
        let cache = MemoryCache::new(config);
        cache.set("k", 7u32, 0);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while cache.contains("k") && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn memory_pressure_event_fires_observer_and_clears() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let config = MemoryCacheConfig::new()
            .with_auto_trim_interval(Duration::ZERO)
            .with_release(Arc::new(InlineRelease))
            .with_on_memory_warning(Arc::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }));
        let cache = MemoryCache::new(config);
        cache.set("k", 1u32, 0);

        let (tx, rx) = broadcast::channel(4);
        cache.observe_platform_events(rx);
        tx.send(PlatformEvent::MemoryPressure).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while cache.contains("k") && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!cache.contains("k"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_event_respects_flag() {
        let config = MemoryCacheConfig::new()
            .with_auto_trim_interval(Duration::ZERO)
            .with_clear_on_background(false)
            .with_release(Arc::new(InlineRelease));
        let cache = MemoryCache::new(config);
        cache.set("k", 1u32, 0);

        let (tx, rx) = broadcast::channel(4);
        cache.observe_platform_events(rx);
        tx.send(PlatformEvent::DidEnterBackground).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.contains("k"));
    }
}
