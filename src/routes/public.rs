//! Unauthenticated read endpoints. Each one spends from its own per-identity
//! budget, then reads through the cache.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use super::respond;
use crate::aggregate::{read_through, ReadSpec};
use crate::buckets::{clamp_top_limit, fold_buckets, resolve_duration, top_moments};
use crate::error::AppError;
use crate::models::{MetaItem, MetaPayload, Segment, SnippetPayload, SnippetRange, SummaryPayload};
use crate::rate_limit::{ClientIdentity, RateQuota};
use crate::state::AppState;

const SUMMARY_QUOTA: RateQuota = RateQuota {
    key_prefix: "public-summary",
    max: 120,
    window: Duration::from_secs(60),
};

const SNIPPET_QUOTA: RateQuota = RateQuota {
    key_prefix: "public-snippet",
    max: 240,
    window: Duration::from_secs(60),
};

const META_QUOTA: RateQuota = RateQuota {
    key_prefix: "public-meta",
    max: 180,
    window: Duration::from_secs(60),
};

const SUMMARY_TTL: Duration = Duration::from_secs(60);
const SNIPPET_TTL: Duration = Duration::from_secs(5 * 60);
const META_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Deserialize)]
pub struct SummaryQuery {
    limit: Option<i64>,
}

pub async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Path(content_id): Path<String>,
    identity: ClientIdentity,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<SummaryPayload>, AppError> {
    let decision = state.limiter.check(&identity.0, SUMMARY_QUOTA, None).await;
    if !decision.ok {
        return Err(AppError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds,
        });
    }

    let limit = clamp_top_limit(query.limit);
    let cache_key = format!("summary:{content_id}:{limit}");
    let spec = ReadSpec {
        cache_key: &cache_key,
        ttl: SUMMARY_TTL,
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
            async move { summary_payload(&state, &content_id, limit).await }
        },
    )
    .await?;

    respond(outcome)
}

async fn summary_payload(
    state: &AppState,
    content_id: &str,
    limit: usize,
) -> Result<SummaryPayload, AppError> {
    let grouped = state.db.grouped_by_bucket(content_id).await?;
    let buckets = fold_buckets(grouped);
    let top_up = top_moments(&buckets, limit);

    let last_segment = state.db.last_segment(content_id).await?;
    let max_vote = state.db.max_vote_seconds(content_id).await?;
    let duration_seconds = resolve_duration(last_segment, max_vote);

    let totals = state.db.vote_totals(content_id).await?;

    Ok(SummaryPayload {
        ok: true,
        content_id: content_id.to_string(),
        duration_seconds,
        totals,
        buckets,
        top_up,
    })
}

#[derive(Deserialize)]
pub struct SnippetQuery {
    center: Option<f64>,
    window: Option<i64>,
}

pub async fn snippet_handler(
    State(state): State<Arc<AppState>>,
    Path(content_id): Path<String>,
    identity: ClientIdentity,
    Query(query): Query<SnippetQuery>,
) -> Result<Json<SnippetPayload>, AppError> {
    let decision = state.limiter.check(&identity.0, SNIPPET_QUOTA, None).await;
    if !decision.ok {
        return Err(AppError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds,
        });
    }

    let center = query
        .center
        .filter(|center| center.is_finite())
        .ok_or_else(|| AppError::BadRequest("center must be a number".to_string()))?;
    let window = query.window.unwrap_or(8).clamp(2, 60);

    let start_range = ((center - window as f64).floor() as i64).max(0);
    let end_range = ((center + window as f64).floor() as i64).max(0);

    let cache_key = format!("snippet:{content_id}:{center}:{window}");
    let spec = ReadSpec {
        cache_key: &cache_key,
        ttl: SNIPPET_TTL,
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
                // Segments starting up to 30s earlier can still overlap the
                // requested range.
                let lower_bound = (start_range - 30).max(0);
                let segments = state
                    .db
                    .segments_between(&content_id, lower_bound as f64, end_range as f64, 120)
                    .await?;
                let segments: Vec<Segment> = segments
                    .into_iter()
                    .filter(|segment| segment.start + segment.dur >= start_range as f64)
                    .take(80)
                    .collect();

                Ok(SnippetPayload {
                    ok: true,
                    content_id,
                    center,
                    window,
                    range: SnippetRange {
                        start: start_range,
                        end: end_range,
                    },
                    segments,
                })
            }
        },
    )
    .await?;

    respond(outcome)
}

pub async fn meta_handler(
    State(state): State<Arc<AppState>>,
    Path(content_id): Path<String>,
    identity: ClientIdentity,
) -> Result<Json<MetaPayload>, AppError> {
    let decision = state.limiter.check(&identity.0, META_QUOTA, None).await;
    if !decision.ok {
        return Err(AppError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds,
        });
    }

    let cache_key = format!("meta:{content_id}");
    let spec = ReadSpec {
        cache_key: &cache_key,
        ttl: META_TTL,
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
                let row = state.db.content_get(&content_id).await?;
                let duration_seconds = state
                    .db
                    .last_segment(&content_id)
                    .await?
                    .map(|segment| (segment.start + segment.dur).max(0.0));

                let thumbnail_url = content_id
                    .strip_prefix("yt:")
                    .map(str::trim)
                    .filter(|video_id| !video_id.is_empty())
                    .map(|video_id| format!("https://i.ytimg.com/vi/{video_id}/hqdefault.jpg"));

                Ok(MetaPayload {
                    ok: true,
                    item: row.map(|row| MetaItem {
                        row,
                        duration_seconds,
                        thumbnail_url,
                    }),
                })
            }
        },
    )
    .await?;

    respond(outcome)
}
