//! `meteo-sensorflow`: MQTT sensor telemetry ingestion into SQLite, plus a
//! read-only JSON query API over the stored measurements.
//!
//! Module boundaries follow the Explicit Module Boundary Pattern (EMBP):
//! - `schema` prepares storage, `normalize` turns raw payloads into fields,
//!   `subscriber` owns the broker loop and the single-row write path
//! - `routes` is the gateway for every HTTP endpoint
//! - `config`, `error` and `models` are shared by all of the above

pub mod config;
pub mod error;
pub mod models;
pub mod normalize;
pub mod routes;
pub mod schema;
pub mod subscriber;

pub use config::{Config, MqttSettings};
pub use error::{IngestError, PayloadError};
pub use models::{DeviceStatus, Measurement, NewMeasurement, Payload, UNKNOWN_DEVICE};
pub use subscriber::{ConnectionState, Ingester, Stored, Subscriber};
