//! Behavior of the read-through single-flight protocol, driven against an
//! in-process backend that stands in for redis so no server is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moments::aggregate::{read_through, ReadOutcome, ReadSpec, RefreshLimit};
use moments::cache::CacheStore;
use moments::error::AppError;
use moments::lock::{LockManager, LOCK_TTL};
use moments::metrics::CacheMetrics;
use moments::rate_limit::{RateLimiter, RateQuota};
use moments::storage::{LocalBackend, StorageBackend, StorageError};

/// The local backend reporting shared-backend semantics. Its set-if-absent is
/// atomic within the process, which is all these tests need from redis.
struct SharedBackend(LocalBackend);

#[async_trait]
impl StorageBackend for SharedBackend {
    fn is_shared(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.0.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        self.0.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str) -> Result<i64, StorageError> {
        self.0.increment(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        self.0.expire(key, ttl).await
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        self.0.ttl_remaining(key).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        self.0.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.0.delete(key).await
    }
}

struct Harness {
    metrics: Arc<CacheMetrics>,
    cache: CacheStore,
    limiter: RateLimiter,
    locks: LockManager,
}

impl Harness {
    fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        let metrics = Arc::new(CacheMetrics::default());
        Self {
            cache: CacheStore::new(backend.clone(), metrics.clone()),
            limiter: RateLimiter::new(backend.clone(), metrics.clone()),
            locks: LockManager::new(backend, metrics.clone()),
            metrics,
        }
    }

    fn shared() -> Self {
        Self::with_backend(Arc::new(SharedBackend(LocalBackend::default())))
    }

    fn local() -> Self {
        Self::with_backend(Arc::new(LocalBackend::default()))
    }

    async fn read(
        &self,
        force: bool,
        calls: &Arc<AtomicUsize>,
    ) -> Result<ReadOutcome<u64>, AppError> {
        let calls = calls.clone();
        read_through(
            &self.cache,
            &self.limiter,
            &self.locks,
            "1.2.3.4",
            spec(force),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            },
        )
        .await
    }
}

const CACHE_KEY: &str = "summary:test:10";
const LOCK_KEY: &str = "lock:summary:test:10";

const REFRESH_QUOTA: RateQuota = RateQuota {
    key_prefix: "refresh-test",
    max: 2,
    window: Duration::from_secs(60),
};

fn spec(force: bool) -> ReadSpec<'static> {
    ReadSpec {
        cache_key: CACHE_KEY,
        ttl: Duration::from_secs(60),
        force,
        refresh: Some(RefreshLimit {
            quota: REFRESH_QUOTA,
            actor: "actor-1",
        }),
    }
}

fn value_of(outcome: ReadOutcome<u64>) -> u64 {
    match outcome {
        ReadOutcome::Value(value) => value,
        ReadOutcome::RateLimited { .. } => panic!("unexpected rate limit"),
    }
}

#[tokio::test(start_paused = true)]
async fn shared_lock_is_exclusive_until_released_or_expired() {
    let harness = Harness::shared();

    assert!(harness.locks.acquire("lock:x", LOCK_TTL).await);
    assert!(!harness.locks.acquire("lock:x", LOCK_TTL).await);
    assert_eq!(harness.metrics.snapshot().lock_denied, 1);

    harness.locks.release("lock:x").await;
    assert!(harness.locks.acquire("lock:x", LOCK_TTL).await);

    // A crashed holder is reclaimed by the TTL.
    tokio::time::advance(Duration::from_millis(3100)).await;
    assert!(harness.locks.acquire("lock:x", LOCK_TTL).await);
}

#[tokio::test(start_paused = true)]
async fn miss_computes_once_then_serves_from_cache() {
    let harness = Harness::shared();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = harness.read(false, &calls).await.unwrap();
    assert_eq!(value_of(first), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = harness.read(false, &calls).await.unwrap();
    assert_eq!(value_of(second), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The winner released its lock.
    assert!(harness.locks.acquire(LOCK_KEY, LOCK_TTL).await);
}

#[tokio::test(start_paused = true)]
async fn losing_the_lock_serves_the_winners_result() {
    let harness = Harness::shared();
    let calls = Arc::new(AtomicUsize::new(0));

    // Another instance is mid-refresh and has already published its result.
    assert!(harness.locks.acquire(LOCK_KEY, LOCK_TTL).await);
    harness
        .cache
        .set_cached(CACHE_KEY, &7u64, Duration::from_secs(60))
        .await;

    let outcome = harness.read(true, &calls).await.unwrap();
    assert_eq!(value_of(outcome), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn losing_the_lock_with_a_cold_cache_computes_uncoordinated() {
    let harness = Harness::shared();
    let calls = Arc::new(AtomicUsize::new(0));

    // Another instance holds the lock but has published nothing yet.
    assert!(harness.locks.acquire(LOCK_KEY, LOCK_TTL).await);

    let outcome = harness.read(true, &calls).await.unwrap();
    assert_eq!(value_of(outcome), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The result was cached without touching the foreign lock.
    assert_eq!(harness.cache.get_cached::<u64>(CACHE_KEY).await, Some(42));
    assert!(!harness.locks.acquire(LOCK_KEY, LOCK_TTL).await);
}

#[tokio::test(start_paused = true)]
async fn forced_refreshes_spend_from_the_tight_budget() {
    let harness = Harness::shared();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let outcome = harness.read(true, &calls).await.unwrap();
        assert_eq!(value_of(outcome), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    match harness.read(true, &calls).await.unwrap() {
        ReadOutcome::RateLimited {
            retry_after_seconds,
        } => {
            assert!(retry_after_seconds > 0 && retry_after_seconds <= 60);
        }
        ReadOutcome::Value(_) => panic!("third forced refresh should be throttled"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.metrics.snapshot().rate_limited, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_compute_caches_nothing_and_releases_the_lock() {
    let harness = Harness::shared();

    let result: Result<ReadOutcome<u64>, AppError> = read_through(
        &harness.cache,
        &harness.limiter,
        &harness.locks,
        "1.2.3.4",
        spec(false),
        || async { Err(AppError::BadRequest("query exploded".to_string())) },
    )
    .await;

    assert!(result.is_err());
    assert_eq!(harness.cache.get_cached::<u64>(CACHE_KEY).await, None);
    assert!(harness.locks.acquire(LOCK_KEY, LOCK_TTL).await);
}

#[tokio::test(start_paused = true)]
async fn concurrent_forced_refreshes_all_get_a_value() {
    let harness = Harness::shared();
    let calls = Arc::new(AtomicUsize::new(0));

    let slow_compute = || {
        let calls = calls.clone();
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(42u64)
        }
    };

    let (a, b) = tokio::join!(
        read_through(
            &harness.cache,
            &harness.limiter,
            &harness.locks,
            "1.2.3.4",
            spec(true),
            slow_compute(),
        ),
        read_through(
            &harness.cache,
            &harness.limiter,
            &harness.locks,
            "1.2.3.4",
            spec(true),
            slow_compute(),
        ),
    );

    assert_eq!(value_of(a.unwrap()), 42);
    assert_eq!(value_of(b.unwrap()), 42);
    // Duplicate work is bounded by the number of concurrent cold readers.
    assert!(calls.load(Ordering::SeqCst) <= 2);

    let follow_up = harness.read(false, &calls).await.unwrap();
    assert_eq!(value_of(follow_up), 42);
}

#[tokio::test(start_paused = true)]
async fn local_backend_reads_compute_without_coordination() {
    let harness = Harness::local();
    let calls = Arc::new(AtomicUsize::new(0));

    let outcome = harness.read(false, &calls).await.unwrap();
    assert_eq!(value_of(outcome), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A denied local lock is expected, not contention.
    assert_eq!(harness.metrics.snapshot().lock_denied, 0);

    let second = harness.read(false, &calls).await.unwrap();
    assert_eq!(value_of(second), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
