use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use super::ApiError;
use crate::models::{DeviceStatus, Measurement};
use crate::subscriber::now_epoch_secs;

// ---

pub fn router() -> Router<SqlitePool> {
    // ---
    Router::new()
        .route("/api/devices/status", get(status_handler))
        .route("/api/devices/{device_id}/latest", get(latest_handler))
}

#[derive(Debug, sqlx::FromRow)]
struct DeviceSummary {
    device_id: String,
    last_seen: i64,
    message_count: i64,
    firmware_version: Option<String>,
    rssi: Option<i64>,
}

#[derive(Debug, Serialize)]
struct DeviceEntry {
    device_id: String,
    status: DeviceStatus,
    last_seen: i64,
    last_seen_ago: i64,
    message_count: i64,
    firmware_version: Option<String>,
    rssi: Option<i64>,
}

#[derive(Debug, Serialize)]
struct DevicesResponse {
    devices: Vec<DeviceEntry>,
    timestamp: i64,
}

/// Every device ever seen, classified by how recently it reported.
async fn status_handler(State(pool): State<SqlitePool>) -> Result<Json<DevicesResponse>, ApiError> {
    // ---
    debug!("GET /api/devices/status");

    // Bare columns next to MAX() come from the row holding the maximum in SQLite
    let rows: Vec<DeviceSummary> = sqlx::query_as(
        r#"
        SELECT
            device_id,
            MAX(timestamp_server) AS last_seen,
            COUNT(*)              AS message_count,
            firmware_version,
            rssi
        FROM measurements
        GROUP BY device_id
        ORDER BY last_seen DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let now = now_epoch_secs();
    let devices = rows
        .into_iter()
        .map(|row| {
            let last_seen_ago = now - row.last_seen;
            DeviceEntry {
                status: DeviceStatus::from_age(last_seen_ago),
                device_id: row.device_id,
                last_seen: row.last_seen,
                last_seen_ago,
                message_count: row.message_count,
                firmware_version: row.firmware_version,
                rssi: row.rssi,
            }
        })
        .collect();

    Ok(Json(DevicesResponse {
        devices,
        timestamp: now,
    }))
}

/// Newest measurement of one device.
async fn latest_handler(
    Path(device_id): Path<String>,
    State(pool): State<SqlitePool>,
) -> Result<Json<Measurement>, ApiError> {
    // ---
    debug!("GET /api/devices/{}/latest", device_id);

    let row: Option<Measurement> = sqlx::query_as(
        r#"
        SELECT *
        FROM measurements
        WHERE device_id = ?
        ORDER BY timestamp_server DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(&device_id)
    .fetch_optional(&pool)
    .await?;

    row.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Device {} not found", device_id)))
}
