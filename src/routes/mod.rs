//! Read-only query API gateway.
//!
//! Each sibling module exports a subrouter over the shared `SqlitePool`; this
//! gateway merges them and owns the JSON error type they share.

use std::ops::RangeInclusive;

use axum::{
    extract::{rejection::QueryRejection, FromRequestParts, Query},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use sqlx::SqlitePool;

mod data;
mod devices;
mod health;
mod stats;

// ---

pub fn router(pool: SqlitePool) -> Router {
    // ---
    Router::new()
        .merge(devices::router())
        .merge(data::router())
        .merge(stats::router())
        .merge(health::router())
        .with_state(pool)
}

/// Errors surfaced to API callers as `{"error": "..."}`.
#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Storage(sqlx::Error),
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Storage(e)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Storage(e) => {
                tracing::error!("Query failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to query measurements".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// `Query` whose rejections use the JSON error body.
pub(crate) struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

/// Apply a default to an optional query parameter and check its bounds.
pub(crate) fn bounded(
    name: &str,
    value: Option<i64>,
    default: i64,
    range: RangeInclusive<i64>,
) -> Result<i64, ApiError> {
    // ---
    let value = value.unwrap_or(default);
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ApiError::BadRequest(format!(
            "{} must be between {} and {}, got {}",
            name,
            range.start(),
            range.end(),
            value
        )))
    }
}
