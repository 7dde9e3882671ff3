use std::sync::Arc;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::db::Db;
use crate::lock::LockManager;
use crate::meta::MetaClient;
use crate::metrics::CacheMetrics;
use crate::rate_limit::RateLimiter;
use crate::storage::{init_backend, StorageBackend};

pub struct AppState {
    pub config: Config,
    pub db: Db,
    pub backend: Arc<dyn StorageBackend>,
    pub metrics: Arc<CacheMetrics>,
    pub cache: CacheStore,
    pub limiter: RateLimiter,
    pub locks: LockManager,
    pub meta: MetaClient,
}

impl AppState {
    pub async fn new() -> Arc<Self> {
        let config = Config::load();

        let backend = init_backend(&config).await;
        let metrics = Arc::new(CacheMetrics::default());
        let cache = CacheStore::new(backend.clone(), metrics.clone());
        let limiter = RateLimiter::new(backend.clone(), metrics.clone());
        let locks = LockManager::new(backend.clone(), metrics.clone());

        let db = Db::connect(&config);

        Arc::new(Self {
            config,
            db,
            backend,
            metrics,
            cache,
            limiter,
            locks,
            meta: MetaClient::new(),
        })
    }
}
