use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::metrics::CacheMetrics;
use crate::storage::StorageBackend;

/// Typed get/set of JSON-serialized values with a TTL.
///
/// Values are opaque to the store. A backend failure degrades to a miss
/// (reads) or a dropped write (sets); it never surfaces to the caller.
pub struct CacheStore {
    backend: Arc<dyn StorageBackend>,
    metrics: Arc<CacheMetrics>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn StorageBackend>, metrics: Arc<CacheMetrics>) -> Self {
        Self { backend, metrics }
    }

    pub async fn get_cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.metrics.record_miss();
                return None;
            }
            Err(e) => {
                warn!("Cache read for {key} degraded to miss: {e}");
                self.metrics.record_miss();
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.metrics.record_hit();
                Some(value)
            }
            Err(e) => {
                warn!("Discarding undecodable cache entry {key}: {e}");
                self.metrics.record_miss();
                None
            }
        }
    }

    pub async fn set_cached<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Not caching unserializable value for {key}: {e}");
                return;
            }
        };

        match self.backend.set(key, &bytes, ttl).await {
            Ok(()) => self.metrics.record_set(),
            Err(e) => warn!("Cache write for {key} dropped: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBackend;

    fn store() -> (CacheStore, Arc<CacheMetrics>) {
        let metrics = Arc::new(CacheMetrics::default());
        let store = CacheStore::new(Arc::new(LocalBackend::default()), metrics.clone());
        (store, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_roundtrips() {
        let (store, metrics) = store();

        store
            .set_cached("k", &vec![1, 2, 3], Duration::from_secs(15))
            .await;
        let value: Option<Vec<i32>> = store.get_cached("k").await;

        assert_eq!(value, Some(vec![1, 2, 3]));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sets, 1);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_reads_as_miss() {
        let (store, metrics) = store();

        store
            .set_cached("k", &"value".to_string(), Duration::from_secs(15))
            .await;
        tokio::time::advance(Duration::from_secs(16)).await;

        let value: Option<String> = store.get_cached("k").await;
        assert_eq!(value, None);
        assert_eq!(metrics.snapshot().misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_key_counts_a_miss() {
        let (store, metrics) = store();

        let value: Option<String> = store.get_cached("nothing").await;
        assert_eq!(value, None);
        assert_eq!(metrics.snapshot().misses, 1);
        assert_eq!(metrics.snapshot().hits, 0);
    }
}
