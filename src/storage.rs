//! # Storage backends
//!
//! Key/counter/lock storage behind the cache, rate limiter, and lock manager.
//!
//! Two implementations:
//!
//! - [`RedisBackend`]: shared across instances, native TTL, atomic
//!   increment and set-if-absent. Used whenever `REDIS_URL` is configured
//!   and reachable at startup.
//! - [`LocalBackend`]: per-process maps with lazy expiry. Used when no
//!   shared backend is configured. Provides no cross-instance guarantees.
//!
//! Selection happens once in [`init_backend`]; it is never re-evaluated per
//! call. A shared-backend failure on an individual call surfaces as a
//! `StorageError`, which the primitives above translate into "no shared
//! backend" behavior for that call (miss, no-op, allow) instead of an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Subset of backend server stats surfaced on the admin metrics endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDiagnostics {
    pub used_memory_human: Option<String>,
    pub connected_clients: Option<i64>,
    pub total_commands_processed: Option<i64>,
    pub uptime_in_seconds: Option<i64>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Whether entries are visible to other instances. Locks are only
    /// meaningful on a shared backend.
    fn is_shared(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError>;

    /// Increments a counter, creating it at 1 if absent or expired.
    async fn increment(&self, key: &str) -> Result<i64, StorageError>;

    /// Sets a counter's expiry. Callers invoke this only on the first
    /// increment of a window.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Remaining lifetime of a counter, if it exists and carries an expiry.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StorageError>;

    /// Atomically creates an entry with a TTL. Returns true iff this call
    /// created it.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn diagnostics(&self) -> Result<Option<BackendDiagnostics>, StorageError> {
        Ok(None)
    }
}

/// Picks the backend once at startup. An unreachable shared backend logs and
/// falls back to local storage instead of aborting.
pub async fn init_backend(config: &Config) -> Arc<dyn StorageBackend> {
    match &config.redis_url {
        Some(url) => match RedisBackend::connect(url).await {
            Ok(backend) => {
                info!("Connected to shared redis backend");
                Arc::new(backend)
            }
            Err(e) => {
                warn!("Redis unreachable ({e}), using in-process storage");
                Arc::new(LocalBackend::default())
            }
        },
        None => {
            info!("REDIS_URL not set, using in-process storage");
            Arc::new(LocalBackend::default())
        }
    }
}

// ---------------------------------------------------------------------------
// Local

struct LocalEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

struct LocalCounter {
    count: i64,
    expires_at: Option<Instant>,
}

/// In-process storage. Values, counters, and locks live in separate maps,
/// each with the same lazy-expiry discipline: expiry is stored as an
/// absolute instant and checked on read.
#[derive(Default)]
pub struct LocalBackend {
    entries: Mutex<HashMap<String, LocalEntry>>,
    counters: Mutex<HashMap<String, LocalCounter>>,
    locks: Mutex<HashMap<String, Instant>>,
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn is_shared(&self) -> bool {
        false
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            LocalEntry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, StorageError> {
        let mut counters = self.counters.lock().unwrap();
        let now = Instant::now();
        let counter = counters
            .entry(key.to_string())
            .and_modify(|c| {
                if c.expires_at.is_some_and(|at| at <= now) {
                    c.count = 0;
                    c.expires_at = None;
                }
            })
            .or_insert(LocalCounter {
                count: 0,
                expires_at: None,
            });
        counter.count += 1;
        Ok(counter.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        if let Some(counter) = self.counters.lock().unwrap().get_mut(key) {
            counter.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let counters = self.counters.lock().unwrap();
        let remaining = counters
            .get(key)
            .and_then(|c| c.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero());
        Ok(remaining)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        _value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        match locks.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                locks.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.locks.lock().unwrap().remove(key);
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis

pub struct RedisBackend {
    connection: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str) -> Result<Self, StorageError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(100));

        let client = Client::open(redis_url)?;
        let connection = client.get_connection_manager_with_config(config).await?;

        Ok(Self { connection })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    fn is_shared(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value: Option<Vec<u8>> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        let seconds = (ttl.as_millis() as u64).div_ceil(1000).max(1);
        let () = self.conn().set_ex(key, value, seconds).await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, StorageError> {
        let count: i64 = self.conn().incr(key, 1i64).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        let () = self.conn().pexpire(key, ttl.as_millis() as i64).await?;
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let millis: i64 = self.conn().pttl(key).await?;
        // -2 means no key, -1 means no expiry.
        Ok((millis > 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let () = self.conn().del(key).await?;
        Ok(())
    }

    async fn diagnostics(&self) -> Result<Option<BackendDiagnostics>, StorageError> {
        let info: String = redis::cmd("INFO").query_async(&mut self.conn()).await?;

        let mut diagnostics = BackendDiagnostics::default();
        for line in info.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key {
                "used_memory_human" => diagnostics.used_memory_human = Some(value.to_string()),
                "connected_clients" => diagnostics.connected_clients = value.parse().ok(),
                "total_commands_processed" => {
                    diagnostics.total_commands_processed = value.parse().ok()
                }
                "uptime_in_seconds" => diagnostics.uptime_in_seconds = value.parse().ok(),
                _ => {}
            }
        }

        Ok(Some(diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn local_get_returns_value_until_expiry() {
        let backend = LocalBackend::default();
        backend
            .set("k", b"v", Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn local_counter_resets_after_window() {
        let backend = LocalBackend::default();

        assert_eq!(backend.increment("r").await.unwrap(), 1);
        backend.expire("r", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.increment("r").await.unwrap(), 2);
        assert_eq!(backend.increment("r").await.unwrap(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(backend.increment("r").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_ttl_remaining_counts_down() {
        let backend = LocalBackend::default();
        backend.increment("r").await.unwrap();
        backend.expire("r", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        let remaining = backend.ttl_remaining("r").await.unwrap().unwrap();
        assert_eq!(remaining, Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(41)).await;
        assert_eq!(backend.ttl_remaining("r").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn local_set_if_absent_is_exclusive_until_expiry() {
        let backend = LocalBackend::default();

        assert!(backend
            .set_if_absent("l", b"1", Duration::from_secs(3))
            .await
            .unwrap());
        assert!(!backend
            .set_if_absent("l", b"1", Duration::from_secs(3))
            .await
            .unwrap());

        backend.delete("l").await.unwrap();
        assert!(backend
            .set_if_absent("l", b"1", Duration::from_secs(3))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(backend
            .set_if_absent("l", b"1", Duration::from_secs(3))
            .await
            .unwrap());
    }
}
