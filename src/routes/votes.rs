use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::{respond, Actor};
use crate::aggregate::{read_through, ReadSpec};
use crate::buckets::{bucket_for, DEFAULT_BUCKET_SIZE};
use crate::db::NewVote;
use crate::error::AppError;
use crate::filters::VoteFilterQuery;
use crate::models::{VoteSavedPayload, VoteType, VotesListPayload};
use crate::rate_limit::ClientIdentity;
use crate::state::AppState;

const USER_VOTES_TTL: Duration = Duration::from_secs(20);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    content_id: Option<String>,
    /// Older clients send a bare video id instead of a content id.
    video_id: Option<String>,
    time_seconds: Option<f64>,
    vote: Option<String>,
    page_url: Option<String>,
    page_host: Option<String>,
}

pub async fn vote_handler(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(body): Json<VoteRequest>,
) -> Result<Json<VoteSavedPayload>, AppError> {
    let content_id = body
        .content_id
        .filter(|id| !id.is_empty())
        .or_else(|| {
            body.video_id
                .filter(|id| !id.is_empty())
                .map(|id| format!("yt:{id}"))
        })
        .ok_or_else(|| AppError::BadRequest("contentId required".to_string()))?;

    let time_seconds_raw = body
        .time_seconds
        .filter(|seconds| seconds.is_finite())
        .ok_or_else(|| AppError::BadRequest("timeSeconds must be a number".to_string()))?;

    let vote_type = body
        .vote
        .as_deref()
        .and_then(VoteType::parse)
        .ok_or_else(|| AppError::BadRequest("vote must be UP or DOWN".to_string()))?;

    let time_seconds = time_seconds_raw.floor().max(0.0) as i32;
    let time_bucket = bucket_for(time_seconds, DEFAULT_BUCKET_SIZE);

    let saved = state
        .db
        .upsert_vote(NewVote {
            user_id: &actor.0,
            content_id: &content_id,
            time_seconds,
            time_bucket,
            vote_type,
            page_url: body.page_url.as_deref(),
            page_host: body.page_host.as_deref(),
        })
        .await?;

    Ok(Json(VoteSavedPayload { ok: true, saved }))
}

pub async fn user_votes_handler(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    identity: ClientIdentity,
    Query(query): Query<VoteFilterQuery>,
) -> Result<Json<VotesListPayload>, AppError> {
    let (mut filter, limit) = query.into_filter();
    // The listing is always scoped to the requesting actor, whatever the
    // query says.
    filter.user_id = Some(actor.0.clone());

    let cache_key = format!(
        "user-votes:{}:{}:{limit}",
        actor.0,
        filter.cache_key_fragment()
    );
    let spec = ReadSpec {
        cache_key: &cache_key,
        ttl: USER_VOTES_TTL,
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
