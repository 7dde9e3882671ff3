//! Per-content detail: the one endpoint that exercises the full forced
//! refresh protocol (tight per-actor budget, then the refresh lock).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use super::{actor_id, respond};
use crate::aggregate::{read_through, ReadSpec, RefreshLimit};
use crate::error::AppError;
use crate::models::{ContentDetailPayload, ContentItem};
use crate::rate_limit::{ClientIdentity, RateQuota};
use crate::state::AppState;

const REFRESH_QUOTA: RateQuota = RateQuota {
    key_prefix: "refresh-content-detail",
    max: 30,
    window: Duration::from_secs(60),
};

const DETAIL_TTL: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
pub struct DetailQuery {
    fresh: Option<String>,
    force: Option<String>,
}

pub async fn detail_handler(
    State(state): State<Arc<AppState>>,
    Path(content_id): Path<String>,
    identity: ClientIdentity,
    headers: HeaderMap,
    Query(query): Query<DetailQuery>,
) -> Result<Json<ContentDetailPayload>, AppError> {
    let fresh = flag(query.fresh.as_deref(), &headers, "x-cache-bypass");
    let force_meta = flag(query.force.as_deref(), &headers, "x-meta-refresh");

    let actor = actor_id(&headers).unwrap_or_else(|| identity.0.clone());

    let cache_key = format!("content-detail:{content_id}");
    let spec = ReadSpec {
        cache_key: &cache_key,
        ttl: DETAIL_TTL,
        force: fresh,
        refresh: Some(RefreshLimit {
            quota: REFRESH_QUOTA,
            actor: &actor,
        }),
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
            async move { detail_payload(&state, &content_id, force_meta).await }
        },
    )
    .await?;

    respond(outcome)
}

fn flag(param: Option<&str>, headers: &HeaderMap, header: &str) -> bool {
    param == Some("1")
        || headers
            .get(header)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == "1")
}

async fn detail_payload(
    state: &AppState,
    content_id: &str,
    force_meta: bool,
) -> Result<ContentDetailPayload, AppError> {
    let mut row = state.db.content_get(content_id).await?;

    if let Some(video_id) = content_id.strip_prefix("yt:") {
        let missing_title = row.as_ref().map_or(true, |row| row.title.is_none());
        if force_meta || missing_title {
            let meta = state.meta.lookup(&state.cache, video_id, force_meta).await;
            if !meta.is_empty() {
                state
                    .db
                    .content_set_meta(
                        content_id,
                        meta.title.as_deref(),
                        meta.channel_name.as_deref(),
                    )
                    .await?;
                if let Some(row) = row.as_mut() {
                    if meta.title.is_some() {
                        row.title = meta.title;
                    }
                    if meta.channel_name.is_some() {
                        row.channel_name = meta.channel_name;
                    }
                }
            }
        }
    }

    let duration_seconds = state
        .db
        .last_segment(content_id)
        .await?
        .map(|segment| (segment.start + segment.dur).max(0.0));

    Ok(ContentDetailPayload {
        ok: true,
        item: row.map(|row| ContentItem {
            row,
            duration_seconds,
        }),
    })
}
