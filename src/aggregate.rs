//! Read-through caching with single-flight refresh.
//!
//! Every expensive aggregation endpoint funnels through [`read_through`]:
//!
//! 1. Unless a refresh was forced, a cache hit is terminal.
//! 2. A forced refresh spends from a tighter per-actor budget before any
//!    work happens.
//! 3. A short-lived lock elects one computer per key. Losers re-check the
//!    cache once (the winner may have just finished), then compute anyway
//!    rather than wait. Duplicate work stays bounded by the number of
//!    concurrent cold readers, and nobody starves.
//!
//! This is best-effort deduplication, not mutual exclusion: the last write
//! wins by completion order, and readers may briefly observe results a few
//! seconds stale. The dashboard tolerates that by design of its refresh
//! button.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::CacheStore;
use crate::error::AppError;
use crate::lock::{LockManager, LOCK_TTL};
use crate::rate_limit::{RateLimiter, RateQuota};

pub struct RefreshLimit<'a> {
    pub quota: RateQuota,
    /// Scopes the refresh budget to the acting user rather than the network
    /// identity alone.
    pub actor: &'a str,
}

pub struct ReadSpec<'a> {
    pub cache_key: &'a str,
    pub ttl: Duration,
    pub force: bool,
    pub refresh: Option<RefreshLimit<'a>>,
}

#[derive(Debug)]
pub enum ReadOutcome<T> {
    Value(T),
    RateLimited { retry_after_seconds: u64 },
}

pub async fn read_through<T, F, Fut>(
    cache: &CacheStore,
    limiter: &RateLimiter,
    locks: &LockManager,
    identity: &str,
    spec: ReadSpec<'_>,
    compute: F,
) -> Result<ReadOutcome<T>, AppError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    if !spec.force {
        if let Some(value) = cache.get_cached::<T>(spec.cache_key).await {
            return Ok(ReadOutcome::Value(value));
        }
    } else if let Some(refresh) = &spec.refresh {
        let decision = limiter
            .check(identity, refresh.quota, Some(refresh.actor))
            .await;
        if !decision.ok {
            return Ok(ReadOutcome::RateLimited {
                retry_after_seconds: decision.retry_after_seconds,
            });
        }
    }

    let lock_key = format!("lock:{}", spec.cache_key);

    if locks.acquire(&lock_key, LOCK_TTL).await {
        let value = match compute().await {
            Ok(value) => value,
            Err(e) => {
                // Nothing gets cached and no lock dangles on a failed compute.
                locks.release(&lock_key).await;
                return Err(e);
            }
        };
        cache.set_cached(spec.cache_key, &value, spec.ttl).await;
        locks.release(&lock_key).await;
        return Ok(ReadOutcome::Value(value));
    }

    // Someone else holds the lock; they may already have published a result.
    if let Some(value) = cache.get_cached::<T>(spec.cache_key).await {
        return Ok(ReadOutcome::Value(value));
    }

    // Still nothing. Compute uncoordinated instead of waiting on the holder;
    // the write happens without re-acquiring the lock.
    let value = compute().await?;
    cache.set_cached(spec.cache_key, &value, spec.ttl).await;
    Ok(ReadOutcome::Value(value))
}
