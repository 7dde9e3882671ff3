use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::metrics::CacheMetrics;
use crate::storage::StorageBackend;

/// TTL on every refresh lock. Long enough to cover a slow aggregate query,
/// short enough that a crashed holder is reclaimed quickly.
pub const LOCK_TTL: Duration = Duration::from_millis(3000);

/// Non-blocking mutual exclusion with TTL auto-expiry.
///
/// The lock's only purpose is cross-instance coordination, so against the
/// local backend `acquire` always reports failure instead of pretending an
/// in-process map can exclude other instances. Release is an unconditional
/// delete; there is no ownership token.
pub struct LockManager {
    backend: Arc<dyn StorageBackend>,
    metrics: Arc<CacheMetrics>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn StorageBackend>, metrics: Arc<CacheMetrics>) -> Self {
        Self { backend, metrics }
    }

    /// Returns true iff this call created the lock. False means someone else
    /// is already doing the work (or no shared backend is available); the
    /// caller picks its own fallback.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> bool {
        if !self.backend.is_shared() {
            return false;
        }

        match self.backend.set_if_absent(key, b"1", ttl).await {
            Ok(true) => true,
            Ok(false) => {
                self.metrics.record_lock_denied();
                false
            }
            Err(e) => {
                warn!("Lock {key} unavailable, treating as not acquired: {e}");
                false
            }
        }
    }

    pub async fn release(&self, key: &str) {
        if !self.backend.is_shared() {
            return;
        }

        if let Err(e) = self.backend.delete(key).await {
            warn!("Releasing {key} failed, TTL will reclaim it: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBackend;

    #[tokio::test]
    async fn local_backend_never_grants_the_lock() {
        let metrics = Arc::new(CacheMetrics::default());
        let locks = LockManager::new(Arc::new(LocalBackend::default()), metrics.clone());

        assert!(!locks.acquire("lock:x", LOCK_TTL).await);
        assert!(!locks.acquire("lock:x", LOCK_TTL).await);
        // Not contention, just no shared backend.
        assert_eq!(metrics.snapshot().lock_denied, 0);
    }
}
