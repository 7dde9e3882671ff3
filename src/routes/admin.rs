//! Dashboard aggregation endpoints. Auth lives in the proxy in front of this
//! service; these handlers only shape the listings the dashboard draws.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::respond;
use crate::aggregate::{read_through, ReadSpec};
use crate::buckets::{fold_buckets, resolve_duration};
use crate::error::AppError;
use crate::filters::VoteFilterQuery;
use crate::metrics::MetricsSnapshot;
use crate::models::{AdminContentPayload, StatsPayload, TimelinePayload, VotesListPayload};
use crate::rate_limit::ClientIdentity;
use crate::state::AppState;
use crate::storage::BackendDiagnostics;

const LISTING_TTL: Duration = Duration::from_secs(15);
const STATS_TTL: Duration = Duration::from_secs(30);

pub async fn content_handler(
    State(state): State<Arc<AppState>>,
    identity: ClientIdentity,
    Query(query): Query<VoteFilterQuery>,
) -> Result<Json<AdminContentPayload>, AppError> {
    let (filter, limit) = query.into_filter();
    let cache_key = format!("admin-content:{}:{limit}", filter.cache_key_fragment());
    let spec = ReadSpec {
        cache_key: &cache_key,
        ttl: LISTING_TTL,
        force: false,
        refresh: None,
    };

    let outcome = read_through(
        &state.cache,
        &state.limiter,
        &state.locks,
        &identity.0,
        spec,
        || {
            let state = state.clone();
            async move {
                let items = state.db.content_activity(&filter, limit).await?;
                Ok(AdminContentPayload { ok: true, items })
            }
        },
    )
    .await?;

    respond(outcome)
}

pub async fn votes_handler(
    State(state): State<Arc<AppState>>,
    identity: ClientIdentity,
    Query(query): Query<VoteFilterQuery>,
) -> Result<Json<VotesListPayload>, AppError> {
    let (filter, limit) = query.into_filter();
    let cache_key = format!("admin-votes:{}:{limit}", filter.cache_key_fragment());
    let spec = ReadSpec {
        cache_key: &cache_key,
        ttl: LISTING_TTL,
        force: false,
        refresh: None,
    };

    let outcome = read_through(
        &state.cache,
        &state.limiter,
        &state.locks,
        &identity.0,
        spec,
        || {
            let state = state.clone();
            async move {
                let (votes, total) = state.db.votes_list(&filter, limit).await?;
                Ok(VotesListPayload {
                    ok: true,
                    total,
                    votes,
                })
            }
        },
    )
    .await?;

    respond(outcome)
}

pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    identity: ClientIdentity,
) -> Result<Json<StatsPayload>, AppError> {
    let spec = ReadSpec {
        cache_key: "admin-stats",
        ttl: STATS_TTL,
        force: false,
        refresh: None,
    };

    let outcome = read_through(
        &state.cache,
        &state.limiter,
        &state.locks,
        &identity.0,
        spec,
        || {
            let state = state.clone();
            async move {
                let (totals, top_content, top_users) = state.db.stats().await?;
                Ok(StatsPayload {
                    ok: true,
                    totals,
                    top_content,
                    top_users,
                })
            }
        },
    )
    .await?;

    respond(outcome)
}

pub async fn timeline_handler(
    State(state): State<Arc<AppState>>,
    Path(content_id): Path<String>,
    identity: ClientIdentity,
) -> Result<Json<TimelinePayload>, AppError> {
    let cache_key = format!("admin-content-summary:{content_id}");
    let spec = ReadSpec {
        cache_key: &cache_key,
        ttl: LISTING_TTL,
        force: false,
        refresh: None,
    };

    let outcome = read_through(
        &state.cache,
        &state.limiter,
        &state.locks,
        &identity.0,
        spec,
        || {
            let state = state.clone();
            let content_id = content_id.clone();
            async move {
                let grouped = state.db.grouped_by_bucket(&content_id).await?;
                let timeline = fold_buckets(grouped);

                let last_segment = state.db.last_segment(&content_id).await?;
                let max_vote = state.db.max_vote_seconds(&content_id).await?;
                let duration_seconds = resolve_duration(last_segment, max_vote);

                let totals = state.db.vote_totals(&content_id).await?;

                Ok(TimelinePayload {
                    ok: true,
                    content_id,
                    totals,
                    duration_seconds,
                    timeline,
                })
            }
        },
    )
    .await?;

    respond(outcome)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<BackendDiagnostics>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetricsPayload {
    pub ok: bool,
    pub metrics: MetricsSnapshot,
    pub backend: BackendInfo,
}

pub async fn cache_metrics_handler(
    State(state): State<Arc<AppState>>,
) -> Json<CacheMetricsPayload> {
    let diagnostics = match state.backend.diagnostics().await {
        Ok(diagnostics) => diagnostics,
        Err(e) => {
            warn!("Backend diagnostics unavailable: {e}");
            None
        }
    };

    Json(CacheMetricsPayload {
        ok: true,
        metrics: state.metrics.snapshot(),
        backend: BackendInfo {
            kind: if state.backend.is_shared() {
                "redis"
            } else {
                "local"
            },
            diagnostics,
        },
    })
}

#[derive(Deserialize)]
pub struct MetricsAction {
    action: Option<String>,
}

pub async fn cache_metrics_action_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MetricsAction>,
) -> Result<Json<Value>, AppError> {
    match body.action.as_deref() {
        Some("reset") => {
            state.metrics.reset();
            Ok(Json(json!({ "ok": true })))
        }
        _ => Err(AppError::BadRequest("Unknown action".to_string())),
    }
}
