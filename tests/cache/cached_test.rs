use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use chatstats::cache::{Cached, MemoryStore, ResultCache, SqliteStore};
use chatstats::cached_fn;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatstats=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ThreadStats {
    count: i64,
}

static SLOW_CALLS: AtomicUsize = AtomicUsize::new(0);

async fn slow_thread_stats((thread_id,): (i64,)) -> ThreadStats {
    SLOW_CALLS.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    ThreadStats {
        count: if thread_id == 42 { 7 } else { 0 },
    }
}

fn memory_cache() -> Arc<ResultCache> {
    init_tracing();
    Arc::new(ResultCache::new(Arc::new(MemoryStore::new())))
}

fn counting(calls: &Arc<AtomicUsize>) -> impl Fn((i64,)) -> Vec<i64> {
    let calls = calls.clone();
    move |(n,): (i64,)| {
        calls.fetch_add(1, Ordering::SeqCst);
        (0..n).collect()
    }
}

#[tokio::test]
async fn test_second_call_is_served_from_cache() {
    let cache = memory_cache();
    let stats = cached_fn!(cache.clone(), slow_thread_stats);
    assert!(stats.identity().ends_with("slow_thread_stats"));

    assert!(!stats.has_cache_for(&(42i64,)));
    let first = stats.call((42i64,)).await;
    assert_eq!(first, ThreadStats { count: 7 });
    assert!(stats.has_cache_for(&(42i64,)));

    let started = Instant::now();
    let second = stats.call((42i64,)).await;
    assert_eq!(second, first);
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(SLOW_CALLS.load(Ordering::SeqCst), 1);

    // different arguments are a different entry
    assert!(!stats.has_cache_for(&(43i64,)));
}

#[test]
fn test_empty_results_are_not_cached() {
    let cache = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let numbers = Cached::new(cache.clone(), "numbers", counting(&calls));

    assert!(numbers.call_sync((0i64,)).is_empty());
    assert!(numbers.call_sync((0i64,)).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!numbers.has_cache_for(&(0i64,)));

    assert_eq!(numbers.call_sync((3i64,)), vec![0, 1, 2]);
    assert_eq!(numbers.call_sync((3i64,)), vec![0, 1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_epoch_change_clears_namespace() {
    let cache = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let numbers = Cached::new(cache.clone(), "numbers", counting(&calls));

    assert!(cache.observe_epoch("epoch-a").unwrap());
    numbers.call_sync((2i64,));
    assert!(numbers.has_cache_for(&(2i64,)));

    // same epoch keeps entries
    assert!(!cache.observe_epoch("epoch-a").unwrap());
    assert!(numbers.has_cache_for(&(2i64,)));

    assert!(cache.observe_epoch("epoch-b").unwrap());
    assert!(!numbers.has_cache_for(&(2i64,)));
    assert_eq!(cache.stored_epoch().unwrap().as_deref(), Some("epoch-b"));

    numbers.call_sync((2i64,));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_result_computed_across_epoch_change_is_not_stored() {
    let cache = memory_cache();
    cache.observe_epoch("epoch-a").unwrap();

    let rotating = {
        let cache = cache.clone();
        move |(n,): (i64,)| {
            cache.observe_epoch("epoch-b").unwrap();
            vec![n]
        }
    };
    let wrapped = Cached::new(cache.clone(), "rotating", rotating);

    assert_eq!(wrapped.call_sync((5i64,)), vec![5]);
    assert!(!wrapped.has_cache_for(&(5i64,)));
}

#[test]
fn test_quota_failure_is_swallowed() {
    init_tracing();
    let cache = Arc::new(ResultCache::new(Arc::new(MemoryStore::with_quota(16))));
    let calls = Arc::new(AtomicUsize::new(0));
    let numbers = Cached::new(cache.clone(), "numbers", counting(&calls));

    assert_eq!(numbers.call_sync((50i64,)).len(), 50);
    assert_eq!(numbers.call_sync((50i64,)).len(), 50);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_errors_are_not_cached() {
    let cache = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = {
        let calls = calls.clone();
        move |(n,): (i64,)| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err("database busy".to_string())
                } else {
                    Ok(vec![n])
                }
            }
        }
    };
    let wrapped = Cached::new(cache, "flaky", flaky);

    assert!(wrapped.try_call((1i64,)).await.is_err());
    assert_eq!(wrapped.try_call((1i64,)).await, Ok(vec![1]));
    assert_eq!(wrapped.try_call((1i64,)).await, Ok(vec![1]));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_disabled_cache_always_calls_through() {
    let cache = Arc::new(ResultCache::disabled());
    let calls = Arc::new(AtomicUsize::new(0));
    let numbers = Cached::new(cache, "numbers", counting(&calls));

    numbers.call_sync((2i64,));
    numbers.call_sync((2i64,));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!numbers.has_cache_for(&(2i64,)));
}

#[test]
fn test_results_survive_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let cache = Arc::new(ResultCache::new(Arc::new(SqliteStore::open_at(&path).unwrap())));
        cache.observe_epoch("epoch-a").unwrap();
        let numbers = Cached::new(cache, "numbers", counting(&calls));
        assert_eq!(numbers.call_sync((4i64,)), vec![0, 1, 2, 3]);
    }

    let cache = Arc::new(ResultCache::new(Arc::new(SqliteStore::open_at(&path).unwrap())));
    assert!(!cache.observe_epoch("epoch-a").unwrap());
    let numbers = Cached::new(cache, "numbers", counting(&calls));
    assert!(numbers.has_cache_for(&(4i64,)));
    assert_eq!(numbers.call_sync((4i64,)), vec![0, 1, 2, 3]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
