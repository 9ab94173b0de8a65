use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use sqlx::SqlitePool;

use super::ApiError;

// ---

pub fn router() -> Router<SqlitePool> {
    // ---
    Router::new().route("/api/stats", get(handler))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct Overall {
    total_measurements: i64,
    total_devices: i64,
    first_measurement: Option<i64>,
    last_measurement: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct PerDevice {
    device_id: String,
    measurement_count: i64,
    first_seen: i64,
    last_seen: i64,
    avg_temp_dht22: Option<f64>,
    avg_temp_bmp280: Option<f64>,
    avg_humidity: Option<f64>,
    avg_pressure: Option<f64>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    overall: Overall,
    devices: Vec<PerDevice>,
}

/// Totals over the whole table plus per-device summaries.
async fn handler(State(pool): State<SqlitePool>) -> Result<Json<StatsResponse>, ApiError> {
    // ---
    let overall: Overall = sqlx::query_as(
        r#"
        SELECT
            COUNT(*)                  AS total_measurements,
            COUNT(DISTINCT device_id) AS total_devices,
            MIN(timestamp_server)     AS first_measurement,
            MAX(timestamp_server)     AS last_measurement
        FROM measurements
        "#,
    )
    .fetch_one(&pool)
    .await?;

    let devices: Vec<PerDevice> = sqlx::query_as(
        r#"
        SELECT
            device_id,
            COUNT(*)                    AS measurement_count,
            MIN(timestamp_server)       AS first_seen,
            MAX(timestamp_server)       AS last_seen,
            AVG(dht22_temperature_c)    AS avg_temp_dht22,
            AVG(bmp280_temperature_c)   AS avg_temp_bmp280,
            AVG(dht22_humidity_percent) AS avg_humidity,
            AVG(bmp280_pressure_pa)     AS avg_pressure
        FROM measurements
        GROUP BY device_id
        ORDER BY device_id
        "#,
    )
    .fetch_all(&pool)
    .await?;

    Ok(Json(StatsResponse { overall, devices }))
}
