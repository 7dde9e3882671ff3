//! Backend for browsing timestamped reactions against video content.
//!
//!
//!
//! # General Infrastructure
//! - Clients talk to a reverse proxy which verifies sessions and forwards the
//!   resolved actor id in a header
//! - This service owns the vote store, the transcript snippets, and every
//!   aggregation the dashboard draws
//! - Postgres holds the raw rows; all group-by/aggregate reads go through the
//!   cache layer first
//!
//!
//!
//! # Notes
//!
//! ## Redis + local fallback
//! Aggregations are cheap to serve and expensive to compute, so every
//! expensive read is cached with a short TTL. With `REDIS_URL` set the cache,
//! rate counters, and refresh locks live in Redis and are shared by all
//! instances; without it everything lives in-process and refresh locks are
//! simply never granted, because a per-process lock cannot exclude another
//! instance.
//!
//! An unreachable Redis never fails a request. Every primitive degrades for
//! that call: reads miss, writes drop, rate checks allow, locks deny. Users
//! see slightly stale data, not errors.
//!
//! ## Freshness
//! A reader that loses the refresh race may get a result computed a few
//! seconds earlier. That is deliberate; the dashboard has a refresh button
//! and tolerates eventual freshness, and the alternative is blocking reads
//! behind the slowest writer.
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    http::{header::CONTENT_TYPE, Method},
    routing::{get, post},
    Router,
};

use tokio::{
    net::TcpListener,
    signal::{
        ctrl_c,
        unix::{signal, SignalKind},
    },
};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

pub mod aggregate;
pub mod buckets;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod filters;
pub mod lock;
pub mod meta;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod storage;

use routes::{
    admin::{
        cache_metrics_action_handler, cache_metrics_handler, content_handler, stats_handler,
        timeline_handler, votes_handler,
    },
    content::detail_handler,
    health_handler,
    public::{meta_handler, snippet_handler, summary_handler},
    votes::{user_votes_handler, vote_handler},
};
use state::AppState;

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await;

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/vote", post(vote_handler))
        .route("/api/content/:content_id", get(detail_handler))
        .route(
            "/api/public/content/:content_id/summary",
            get(summary_handler),
        )
        .route(
            "/api/public/content/:content_id/snippet",
            get(snippet_handler),
        )
        .route("/api/public/content/:content_id/meta", get(meta_handler))
        .route("/api/user/votes", get(user_votes_handler))
        .route("/api/admin/content", get(content_handler))
        .route(
            "/api/admin/content/:content_id/timeline",
            get(timeline_handler),
        )
        .route("/api/admin/votes", get(votes_handler))
        .route("/api/admin/stats", get(stats_handler))
        .route(
            "/api/admin/cache/metrics",
            get(cache_metrics_handler).post(cache_metrics_action_handler),
        )
        .layer(cors)
        .with_state(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    println!("Server shutting down...");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
