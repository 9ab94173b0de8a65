//! Database schema management for `meteo-sensorflow`.
//!
//! Ensures the measurement table and its indexes exist before the first write.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use sqlx::SqlitePool;

// ---

/// Create the database schema if it is missing (idempotent).
///
/// Creates the append-only `measurements` table plus the two indexes used by
/// the query API: `(device_id, timestamp_server)` and `(timestamp_server)`.
/// Safe to call on every startup; existing objects and rows are left untouched.
///
/// Errors are propagated if any SQL execution fails.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // ---
    let mut tx = pool.begin().await?;

    // Core table written by the subscriber, read by `/api/*`
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measurements (
            id                     INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id              TEXT    NOT NULL,
            topic                  TEXT    NOT NULL,
            dht22_temperature_c    REAL,
            dht22_humidity_percent REAL,
            bmp280_temperature_c   REAL,
            bmp280_pressure_pa     REAL,
            timestamp_device       INTEGER,
            timestamp_server       INTEGER NOT NULL,
            firmware_version       TEXT,
            rssi                   INTEGER,
            altitude_m             REAL,
            free_heap              INTEGER
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Per-device history and latest-per-device lookups
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_device_time
            ON measurements (device_id, timestamp_server);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Global time-window scans
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_time
            ON measurements (timestamp_server);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
