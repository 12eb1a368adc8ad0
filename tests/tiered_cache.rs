//! End-to-end scenarios for the two-tier cache facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tiercache::{
    DiskCache, DiskValue, InlineRelease, MemoryCache, MemoryCacheConfig, TieredCache,
};

fn quiet_memory_config() -> MemoryCacheConfig {
    // no timer, inline destruction: deterministic assertions
    MemoryCacheConfig::new()
        .with_auto_trim_interval(Duration::ZERO)
        .with_release(Arc::new(InlineRelease))
}

fn open(dir: &TempDir) -> TieredCache {
    TieredCache::with_config(dir.path(), quiet_memory_config(), 16 * 1024).unwrap()
}

fn value(bytes: &[u8]) -> DiskValue {
    DiskValue::new(bytes)
}

#[test]
fn memory_lru_keeps_two_most_recent() {
    // S1: count_limit = 2, three writes, the first is evicted
    let config = quiet_memory_config().with_count_limit(2);
    let memory: MemoryCache<Vec<u8>> = MemoryCache::new(config);
    memory.set("a", b"A".to_vec(), 0);
    memory.set("b", b"B".to_vec(), 0);
    memory.set("c", b"C".to_vec(), 0);
    assert_eq!(memory.get("a"), None);
    assert_eq!(memory.get("b"), Some(b"B".to_vec()));
    assert_eq!(memory.get("c"), Some(b"C".to_vec()));
}

#[test]
fn memory_cost_eviction_keeps_most_recent_write() {
    // S2: cost_limit = 10, two writes of cost 6, the earlier one goes
    let config = quiet_memory_config().with_cost_limit(10);
    let memory: MemoryCache<u8> = MemoryCache::new(config);
    memory.set("x", 1, 6);
    memory.set("y", 2, 6);
    assert!(memory.total_cost() <= 10);
    assert!(memory.contains("y"));
    assert!(!memory.contains("x"));
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_age_eviction_via_auto_trim() {
    // S3: an idle entry disappears once the auto-trim timer catches it
    let config = MemoryCacheConfig::new()
        .with_age_limit(Duration::from_millis(100))
        .with_auto_trim_interval(Duration::from_millis(25))
        .with_release(Arc::new(InlineRelease));
    let memory: MemoryCache<u8> = MemoryCache::new(config);
    memory.set("k", 1, 0);
    let deadline = Instant::now() + Duration::from_secs(3);
    while memory.contains("k") && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(memory.get("k"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn disk_round_trip_survives_reopen() {
    // S4: destroy and recreate the cache on the same path
    let dir = TempDir::new().unwrap();
    {
        let cache = open(&dir);
        assert!(cache.set("k", value(b"hello")));
    }
    let cache = open(&dir);
    assert_eq!(cache.get("k").unwrap().data(), b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn inline_threshold_routes_payloads() {
    // S5: threshold 4, "hi" stays inline, "hello" becomes the only file
    let dir = TempDir::new().unwrap();
    let cache = TieredCache::with_config(dir.path(), quiet_memory_config(), 4).unwrap();
    assert!(cache.set("s", value(b"hi")));
    assert!(cache.set("l", value(b"hello")));
    let files = std::fs::read_dir(dir.path().join("data")).unwrap().count();
    assert_eq!(files, 1);
    assert_eq!(cache.get("s").unwrap().data(), b"hi");
    assert_eq!(cache.get("l").unwrap().data(), b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn disk_hit_promotes_into_memory() {
    // S6: evict from memory, read through, end up memory-resident again
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);
    assert!(cache.set("k", value(b"V")));
    cache.memory_cache().trim_to_count(0);
    assert!(!cache.memory_cache().contains("k"));
    assert_eq!(cache.get("k").unwrap().data(), b"V");
    assert!(cache.memory_cache().contains("k"));
}

#[tokio::test(flavor = "multi_thread")]
async fn set_lands_in_both_tiers() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);
    assert!(cache.set("k", value(b"v")));
    assert!(cache.memory_cache().contains("k"));
    assert!(cache.disk_cache().contains("k"));
    assert!(cache.contains("k"));
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_all_clears_both_tiers() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);
    for i in 0..10 {
        assert!(cache.set(&format!("k{i}"), value(&[i as u8; 32])));
    }
    cache.remove_all();
    assert_eq!(cache.memory_cache().total_count(), 0);
    assert_eq!(cache.disk_cache().total_count(), 0);
    assert_eq!(cache.disk_cache().total_size(), 0);
    assert!(!cache.contains("k0"));
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_is_idempotent_across_tiers() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);
    assert!(cache.set("k", value(b"v")));
    cache.remove("k");
    cache.remove("k");
    assert!(!cache.contains("k"));
}

#[tokio::test(flavor = "multi_thread")]
async fn extended_data_round_trips_through_the_facade() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);
    let mut v = value(b"payload");
    DiskCache::set_extended_data(&mut v, Some(b"sidecar".to_vec()));
    assert!(cache.set("k", v));
    // force the read-through path so the bytes come back from disk
    cache.memory_cache().remove_all();
    let fetched = cache.get("k").unwrap();
    assert_eq!(DiskCache::extended_data(&fetched), Some(&b"sidecar"[..]));
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_clear_returns_before_trash_drains() {
    // trash-drain invariant: data/ is empty immediately, trash/ empties
    // in the background
    let dir = TempDir::new().unwrap();
    let cache = TieredCache::with_config(dir.path(), quiet_memory_config(), 4).unwrap();
    for i in 0..8 {
        assert!(cache.set(&format!("k{i}"), value(&[i as u8; 64])));
    }
    assert_eq!(std::fs::read_dir(dir.path().join("data")).unwrap().count(), 8);

    cache.remove_all();
    assert_eq!(std::fs::read_dir(dir.path().join("data")).unwrap().count(), 0);
    assert_eq!(cache.disk_cache().total_count(), 0);

    let trash = dir.path().join("trash");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if std::fs::read_dir(&trash).unwrap().count() == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "trash never drained");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn async_siblings_invoke_completions() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);

    let (tx, rx) = mpsc::channel();
    let done = tx.clone();
    cache.set_async("k", value(b"async"), move || {
        done.send(("set", None)).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().0, "set");

    let done = tx.clone();
    cache.get_async("k", move |key, found| {
        assert_eq!(key, "k");
        done.send(("get", found)).unwrap();
    });
    let (tag, found) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(tag, "get");
    assert_eq!(found.unwrap().data(), b"async");

    let done = tx.clone();
    cache.contains_async("k", move |key, present| {
        assert_eq!(key, "k");
        assert!(present);
        done.send(("contains", None)).unwrap();
    });
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().0,
        "contains"
    );

    let done = tx.clone();
    cache.remove_async("k", move |key| {
        assert_eq!(key, "k");
        done.send(("remove", None)).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().0, "remove");
    assert!(!cache.contains("k"));

    let done = tx;
    cache.remove_all_async(move || {
        done.send(("clear", None)).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().0, "clear");
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_clear_reports_from_the_facade() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);
    for i in 0..40 {
        assert!(cache.set(&format!("k{i}"), value(b"v")));
    }

    let (tx, rx) = mpsc::channel();
    let reports = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&reports);
    cache.remove_all_with_progress(
        move |done, total| {
            assert!(done <= total);
            seen.fetch_add(1, Ordering::SeqCst);
        },
        move |failed| tx.send(failed).unwrap(),
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), false);
    assert!(reports.load(Ordering::SeqCst) > 1);
    assert_eq!(cache.disk_cache().total_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_writers_and_readers() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);

    let mut tasks = Vec::new();
    for t in 0..8 {
        let cache = cache.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            for i in 0..25 {
                let key = format!("k-{t}-{i}");
                assert!(cache.set(&key, DiskValue::new(key.clone().into_bytes())));
                let read = cache.get(&key).unwrap();
                assert_eq!(read.data(), key.as_bytes());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(cache.disk_cache().total_count(), 8 * 25);
    for t in 0..8 {
        assert!(cache.contains(&format!("k-{t}-0")));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn by_path_names_cache_after_last_segment() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("thumbnails");
    let cache = TieredCache::by_path(&root).unwrap();
    assert_eq!(cache.name(), "thumbnails");
    assert!(cache.set("k", value(b"v")));
    assert!(root.join("manifest.sqlite").exists());
}

#[test]
fn constructors_reject_invalid_input() {
    assert!(TieredCache::by_name("").is_none());
    assert!(TieredCache::by_path("").is_none());
    assert!(DiskCache::new("").is_none());
}
