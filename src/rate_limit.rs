//! Fixed-window request counting per client identity.
//!
//! The first request in a window creates the counter and stamps the window's
//! expiry; every further request increments the same counter until the window
//! lapses, at which point the next request starts a fresh one at 1.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tracing::warn;

use crate::metrics::CacheMetrics;
use crate::storage::StorageBackend;

#[derive(Debug, Clone, Copy)]
pub struct RateQuota {
    pub key_prefix: &'static str,
    /// Inclusive: the `max + 1`-th request of a window is the first rejected.
    pub max: i64,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub ok: bool,
    pub retry_after_seconds: u64,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            ok: true,
            retry_after_seconds: 0,
        }
    }
}

pub struct RateLimiter {
    backend: Arc<dyn StorageBackend>,
    metrics: Arc<CacheMetrics>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn StorageBackend>, metrics: Arc<CacheMetrics>) -> Self {
        Self { backend, metrics }
    }

    pub async fn check(
        &self,
        identity: &str,
        quota: RateQuota,
        key_suffix: Option<&str>,
    ) -> RateDecision {
        let key = match key_suffix {
            Some(suffix) => format!("{}:{identity}:{suffix}", quota.key_prefix),
            None => format!("{}:{identity}", quota.key_prefix),
        };

        let count = match self.backend.increment(&key).await {
            Ok(count) => count,
            Err(e) => {
                // Fail open: an unreachable backend must not turn into a 429.
                warn!("Rate counter {key} unavailable, allowing request: {e}");
                return RateDecision::allow();
            }
        };

        if count == 1 {
            if let Err(e) = self.backend.expire(&key, quota.window).await {
                warn!("Could not stamp window expiry on {key}: {e}");
            }
        }

        if count > quota.max {
            self.metrics.record_rate_limited();
            let remaining = self
                .backend
                .ttl_remaining(&key)
                .await
                .ok()
                .flatten()
                .unwrap_or_default();
            return RateDecision {
                ok: false,
                retry_after_seconds: (remaining.as_millis() as u64).div_ceil(1000),
            };
        }

        RateDecision::allow()
    }
}

/// Best identity we can attribute a request to: first forwarded address,
/// then the proxy-reported client address, then the socket peer, then
/// `"unknown"`.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.to_string();
    }

    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

pub struct ClientIdentity(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Infallible> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        Ok(Self(client_identity(&parts.headers, peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBackend;
    use axum::http::HeaderValue;

    fn limiter() -> (RateLimiter, Arc<CacheMetrics>) {
        let metrics = Arc::new(CacheMetrics::default());
        let limiter = RateLimiter::new(Arc::new(LocalBackend::default()), metrics.clone());
        (limiter, metrics)
    }

    const QUOTA: RateQuota = RateQuota {
        key_prefix: "test",
        max: 3,
        window: Duration::from_secs(60),
    };

    #[tokio::test(start_paused = true)]
    async fn allows_up_to_max_then_rejects() {
        let (limiter, metrics) = limiter();

        for _ in 0..3 {
            assert!(limiter.check("1.2.3.4", QUOTA, None).await.ok);
        }

        let rejected = limiter.check("1.2.3.4", QUOTA, None).await;
        assert!(!rejected.ok);
        assert!(rejected.retry_after_seconds <= 60);
        assert_eq!(metrics.snapshot().rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_starts_a_fresh_count() {
        let (limiter, _) = limiter();

        for _ in 0..4 {
            limiter.check("1.2.3.4", QUOTA, None).await;
        }
        assert!(!limiter.check("1.2.3.4", QUOTA, None).await.ok);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("1.2.3.4", QUOTA, None).await.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn identities_count_independently() {
        let (limiter, _) = limiter();

        for _ in 0..4 {
            limiter.check("1.2.3.4", QUOTA, None).await;
        }
        assert!(limiter.check("5.6.7.8", QUOTA, None).await.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn suffix_scopes_the_counter() {
        let (limiter, _) = limiter();

        for _ in 0..4 {
            limiter.check("1.2.3.4", QUOTA, Some("actor-a")).await;
        }
        assert!(!limiter.check("1.2.3.4", QUOTA, Some("actor-a")).await.ok);
        assert!(limiter.check("1.2.3.4", QUOTA, Some("actor-b")).await.ok);
    }

    #[test]
    fn identity_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("9.9.9.9, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("8.8.8.8"));

        assert_eq!(client_identity(&headers, None), "9.9.9.9");
    }

    #[test]
    fn identity_falls_back_to_peer_then_unknown() {
        let headers = HeaderMap::new();
        let peer = "127.0.0.1:5000".parse().unwrap();

        assert_eq!(client_identity(&headers, Some(peer)), "127.0.0.1");
        assert_eq!(client_identity(&headers, None), "unknown");
    }
}
