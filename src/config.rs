//! Configuration loader for the `meteo-sensorflow` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::{env, time::Duration};

use anyhow::{anyhow, Result};

/// Parse an optional numeric variable with a default value.
macro_rules! parse_var {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Read an optional string variable, treating empty values as unset.
macro_rules! optional_var {
    ($lookup:expr, $var_name:expr) => {
        $lookup($var_name).filter(|v: &String| !v.is_empty())
    };
}

/// Broker connection settings consumed by [`crate::subscriber::run`].
#[derive(Debug, Clone)]
pub struct MqttSettings {
    // ---
    /// Broker host name or address.
    pub host: String,

    /// Broker TCP port.
    pub port: u16,

    /// Optional username, only used together with `password`.
    pub username: Option<String>,

    /// Optional password, only used together with `username`.
    pub password: Option<String>,

    /// Subscription filter, e.g. `sensors/#`.
    pub topic: String,

    /// MQTT client identifier.
    pub client_id: String,

    /// Keep-alive interval announced to the broker.
    pub keep_alive: Duration,

    /// Pause between a connection error and the next reconnect attempt.
    pub retry_delay: Duration,
}

impl MqttSettings {
    /// Credentials to present, only when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Broker connection settings.
    pub mqtt: MqttSettings,

    /// Path of the SQLite database file.
    pub sqlite_db: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Port the query API listens on.
    pub http_port: u16,

    /// Default log level, lower-cased (`info`, `debug`, ...).
    pub log_level: String,
}

/// Load configuration from environment variables with defaults.
///
/// Optional:
/// - `MQTT_BROKER` – broker host (default: `localhost`)
/// - `MQTT_PORT` – broker port (default: 1883)
/// - `MQTT_USERNAME`, `MQTT_PASSWORD` – credentials (default: unauthenticated)
/// - `MQTT_TOPIC` – subscription filter (default: `sensors/#`)
/// - `MQTT_CLIENT_ID` – client id (default: `meteo-sensorflow-<pid>`)
/// - `MQTT_KEEP_ALIVE_SECS` – keep-alive (default: 60)
/// - `MQTT_RETRY_DELAY_SECS` – reconnect pause (default: 5)
/// - `SQLITE_DB` – database file (default: `environment_data.db`)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `HTTP_PORT` – query API port (default: 8080)
/// - `LOG_LEVEL` – log verbosity (default: `INFO`)
///
/// Returns an error if any numeric variable is invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    load_with(|name| env::var(name).ok())
}

/// Build a [`Config`] from an arbitrary variable source.
pub fn load_with<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    // ---
    let host = optional_var!(lookup, "MQTT_BROKER").unwrap_or_else(|| "localhost".into());
    let port = parse_var!(lookup, "MQTT_PORT", u16, 1883);
    let username = optional_var!(lookup, "MQTT_USERNAME");
    let password = optional_var!(lookup, "MQTT_PASSWORD");
    let topic = optional_var!(lookup, "MQTT_TOPIC").unwrap_or_else(|| "sensors/#".into());
    let client_id = optional_var!(lookup, "MQTT_CLIENT_ID")
        .unwrap_or_else(|| format!("meteo-sensorflow-{}", std::process::id()));
    let keep_alive = parse_var!(lookup, "MQTT_KEEP_ALIVE_SECS", u64, 60);
    let retry_delay = parse_var!(lookup, "MQTT_RETRY_DELAY_SECS", u64, 5);

    let sqlite_db =
        optional_var!(lookup, "SQLITE_DB").unwrap_or_else(|| "environment_data.db".into());
    let db_pool_max = parse_var!(lookup, "DB_POOL_MAX", u32, 5);
    let http_port = parse_var!(lookup, "HTTP_PORT", u16, 8080);
    let log_level = optional_var!(lookup, "LOG_LEVEL")
        .unwrap_or_else(|| "INFO".into())
        .to_lowercase();

    if db_pool_max == 0 {
        return Err(anyhow!("Invalid DB_POOL_MAX: must be at least 1"));
    }

    Ok(Config {
        mqtt: MqttSettings {
            host,
            port,
            username,
            password,
            topic,
            client_id,
            keep_alive: Duration::from_secs(keep_alive),
            retry_delay: Duration::from_secs(retry_delay),
        },
        sqlite_db,
        db_pool_max,
        http_port,
        log_level,
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the broker password while showing all other values.
    pub fn log_config(&self) {
        // ---
        let masked_password = self.mqtt.password.as_ref().map(|_| "****");

        tracing::info!("Configuration loaded:");
        tracing::info!("  MQTT_BROKER    : {}:{}", self.mqtt.host, self.mqtt.port);
        tracing::info!("  MQTT_TOPIC     : {}", self.mqtt.topic);
        tracing::info!("  MQTT_CLIENT_ID : {}", self.mqtt.client_id);
        tracing::info!("  MQTT_USERNAME  : {:?}", self.mqtt.username);
        tracing::info!("  MQTT_PASSWORD  : {:?}", masked_password);
        tracing::info!("  SQLITE_DB      : {}", self.sqlite_db);
        tracing::info!("  DB_POOL_MAX    : {}", self.db_pool_max);
        tracing::info!("  HTTP_PORT      : {}", self.http_port);
        tracing::info!("  LOG_LEVEL      : {}", self.log_level);
    }
}
