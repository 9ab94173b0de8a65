//! Application entry point for the `meteo-sensorflow` service.
//!
//! This binary orchestrates the full startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Opening the SQLite connection pool (file created if missing)
//! - Creating the database schema if it does not exist
//! - Running the MQTT subscriber and the Axum query API side by side
//!
//! # Environment Variables
//! See [`meteo_sensorflow::config::load_from_env`] for the full list. Logging
//! additionally honours:
//! - `LOG_LEVEL` – default verbosity (default: `INFO`)
//! - `RUST_LOG` – full filter override
//! - `LOG_SPAN_EVENTS` – span event mode for tracing
//! - `FORCE_COLOR` – force ANSI colors on or off
//!
//! Schema setup is delegated to `schema`, configuration parsing to `config`,
//! the broker loop to `subscriber` and route registration to `routes`.
use std::{env, future::IntoFuture, net::SocketAddr};

use anyhow::{Context, Result};
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use meteo_sensorflow::{config, routes, schema, subscriber, IngestError, Ingester};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    let cfg = config::load_from_env()?;

    init_tracing(&cfg.log_level);
    cfg.log_config();

    tracing::info!("Opening database: {}", cfg.sqlite_db);

    let connect_options = SqliteConnectOptions::new()
        .filename(&cfg.sqlite_db)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect_with(connect_options)
        .await
        .with_context(|| format!("Failed to open database '{}'", cfg.sqlite_db))?;

    schema::ensure_schema(&pool)
        .await
        .map_err(IngestError::SchemaInit)?;

    tracing::info!("Database schema ready");

    let ingester = Ingester::new(pool.clone());

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(pool);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        _ = subscriber::run(&cfg.mqtt, ingester) => {}
        served = axum::serve(listener, app).into_future() => served?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
    }

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `LOG_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level taken from `RUST_LOG` when set, otherwise from `LOG_LEVEL`
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing(log_level: &str) {
    // ---
    let span_events = match env::var("LOG_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match log_level {
            "trace" => "trace",
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" | "critical" => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,rumqttc=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
