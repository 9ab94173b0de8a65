use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use super::{bounded, ApiError, ApiQuery};
use crate::models::Measurement;
use crate::subscriber::now_epoch_secs;

// ---

pub fn router() -> Router<SqlitePool> {
    // ---
    Router::new()
        .route("/api/data/latest", get(latest_handler))
        .route("/api/data/history", get(history_handler))
        .route("/api/data/aggregated", get(aggregated_handler))
}

#[derive(Debug, Serialize)]
struct DataResponse<T: Serialize> {
    data: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval_minutes: Option<i64>,
}

impl<T: Serialize> DataResponse<T> {
    fn new(data: Vec<T>) -> Self {
        DataResponse {
            data,
            hours: None,
            interval_minutes: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    limit: Option<i64>,
}

/// Newest measurements across all devices.
async fn latest_handler(
    ApiQuery(params): ApiQuery<LatestQuery>,
    State(pool): State<SqlitePool>,
) -> Result<Json<DataResponse<Measurement>>, ApiError> {
    // ---
    let limit = bounded("limit", params.limit, 10, 1..=100)?;
    debug!("GET /api/data/latest limit={}", limit);

    let rows = sqlx::query_as::<_, Measurement>(
        r#"
        SELECT *
        FROM measurements
        ORDER BY timestamp_server DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(&pool)
    .await?;

    Ok(Json(DataResponse::new(rows)))
}

/// Query parameters for the time-windowed history
#[derive(Debug, Deserialize)]
struct HistoryQuery {
    device_id: Option<String>,
    hours: Option<i64>,
    limit: Option<i64>,
}

/// Measurements from the last `hours`, newest first, optionally for one device.
async fn history_handler(
    ApiQuery(params): ApiQuery<HistoryQuery>,
    State(pool): State<SqlitePool>,
) -> Result<Json<DataResponse<Measurement>>, ApiError> {
    // ---
    let hours = bounded("hours", params.hours, 24, 1..=168)?;
    let limit = bounded("limit", params.limit, 1000, 1..=10_000)?;
    let since = now_epoch_secs() - hours * 3600;
    debug!("GET /api/data/history {:?}", params);

    let rows = sqlx::query_as::<_, Measurement>(
        r#"
        SELECT *
        FROM measurements
        WHERE (? IS NULL OR device_id = ?)
          AND timestamp_server > ?
        ORDER BY timestamp_server DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(params.device_id.as_deref())
    .bind(params.device_id.as_deref())
    .bind(since)
    .bind(limit)
    .fetch_all(&pool)
    .await?;

    Ok(Json(DataResponse {
        hours: Some(hours),
        ..DataResponse::new(rows)
    }))
}

#[derive(Debug, Deserialize)]
struct AggregatedQuery {
    device_id: Option<String>,
    hours: Option<i64>,
    interval_minutes: Option<i64>,
}

/// Per-device sensor means over fixed time buckets.
#[derive(Debug, Serialize, sqlx::FromRow)]
struct Bucket {
    device_id: String,
    /// Bucket start, epoch seconds aligned to the interval.
    time_bucket: i64,
    avg_dht22_temp: Option<f64>,
    avg_dht22_humidity: Option<f64>,
    avg_bmp280_temp: Option<f64>,
    avg_bmp280_pressure: Option<f64>,
    avg_rssi: Option<f64>,
    sample_count: i64,
}

async fn aggregated_handler(
    ApiQuery(params): ApiQuery<AggregatedQuery>,
    State(pool): State<SqlitePool>,
) -> Result<Json<DataResponse<Bucket>>, ApiError> {
    // ---
    let hours = bounded("hours", params.hours, 24, 1..=168)?;
    let interval_minutes = bounded("interval_minutes", params.interval_minutes, 60, 5..=1440)?;
    let interval_secs = interval_minutes * 60;
    let since = now_epoch_secs() - hours * 3600;
    debug!("GET /api/data/aggregated {:?}", params);

    let rows = sqlx::query_as::<_, Bucket>(
        r#"
        SELECT
            device_id,
            (timestamp_server / ?) * ?  AS time_bucket,
            AVG(dht22_temperature_c)    AS avg_dht22_temp,
            AVG(dht22_humidity_percent) AS avg_dht22_humidity,
            AVG(bmp280_temperature_c)   AS avg_bmp280_temp,
            AVG(bmp280_pressure_pa)     AS avg_bmp280_pressure,
            AVG(rssi)                   AS avg_rssi,
            COUNT(*)                    AS sample_count
        FROM measurements
        WHERE (? IS NULL OR device_id = ?)
          AND timestamp_server > ?
        GROUP BY device_id, time_bucket
        ORDER BY time_bucket ASC, device_id ASC
        "#,
    )
    .bind(interval_secs)
    .bind(interval_secs)
    .bind(params.device_id.as_deref())
    .bind(params.device_id.as_deref())
    .bind(since)
    .fetch_all(&pool)
    .await?;

    Ok(Json(DataResponse {
        interval_minutes: Some(interval_minutes),
        ..DataResponse::new(rows)
    }))
}
