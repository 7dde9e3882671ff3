pub mod admin;
pub mod content;
pub mod public;
pub mod votes;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::aggregate::ReadOutcome;
use crate::error::AppError;

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Actor id resolved by the auth proxy in front of this service.
pub(crate) fn actor_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-actor-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
}

pub struct Actor(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, AppError> {
        actor_id(&parts.headers)
            .map(Self)
            .ok_or(AppError::Unauthorized)
    }
}

pub(crate) fn respond<T: Serialize>(outcome: ReadOutcome<T>) -> Result<Json<T>, AppError> {
    match outcome {
        ReadOutcome::Value(value) => Ok(Json(value)),
        ReadOutcome::RateLimited {
            retry_after_seconds,
        } => Err(AppError::RateLimited {
            retry_after_seconds,
        }),
    }
}
