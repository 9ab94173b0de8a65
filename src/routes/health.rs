// src/routes/health.rs
//! Health endpoints for the meteo query API.
//!
//! Two routes live here and are exported to the gateway (`mod.rs`) as one
//! subrouter:
//! - `/health` is a liveness probe for container orchestrators and never
//!   touches the database.
//! - `/api/health` reports storage statistics and answers 503 when the
//!   database cannot be queried.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;

use crate::models::DeviceStatus;
use crate::subscriber::now_epoch_secs;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Handle `GET /health`.
///
/// Returns a static JSON object indicating the API is reachable.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
struct DatabaseHealth {
    total_records: i64,
    size_bytes: i64,
    size_mb: f64,
}

#[derive(Debug, Serialize)]
struct DeviceActivity {
    active_last_5min: i64,
}

#[derive(Debug, Serialize)]
struct StorageHealth {
    status: &'static str,
    timestamp: i64,
    database: DatabaseHealth,
    devices: DeviceActivity,
}

async fn storage_health(pool: &SqlitePool) -> Result<StorageHealth, sqlx::Error> {
    // ---
    let now = now_epoch_secs();

    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM measurements")
        .fetch_one(pool)
        .await?;

    let active_last_5min: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT device_id) FROM measurements WHERE timestamp_server > ?",
    )
    .bind(now - DeviceStatus::WARNING_SECS)
    .fetch_one(pool)
    .await?;

    let size_bytes: i64 = sqlx::query_scalar(
        "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
    )
    .fetch_one(pool)
    .await?;

    Ok(StorageHealth {
        status: "healthy",
        timestamp: now,
        database: DatabaseHealth {
            total_records,
            size_bytes,
            size_mb: (size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
        },
        devices: DeviceActivity { active_last_5min },
    })
}

/// Handle `GET /api/health`.
async fn api_health(State(pool): State<SqlitePool>) -> impl IntoResponse {
    // ---
    match storage_health(&pool).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Create a subrouter containing the health routes.
pub fn router() -> Router<SqlitePool> {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(api_health))
}
