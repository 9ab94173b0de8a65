//! Data models for the measurement pipeline.

use serde::{Deserialize, Serialize};

// ---

/// Device id stored when the payload does not carry a usable one.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Fields extracted from one inbound payload.
///
/// Every field except `device_id` is optional; absent or wrong-typed values
/// are `None`, never a zero or empty placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    // ---
    pub device_id: String,
    pub firmware_version: Option<String>,
    pub timestamp_device: Option<i64>,
    pub rssi: Option<i64>,
    pub altitude_m: Option<f64>,
    pub free_heap: Option<i64>,
    pub dht22_temperature_c: Option<f64>,
    pub dht22_humidity_percent: Option<f64>,
    pub bmp280_temperature_c: Option<f64>,
    pub bmp280_pressure_pa: Option<f64>,
}

impl Default for Payload {
    fn default() -> Self {
        Payload {
            device_id: UNKNOWN_DEVICE.to_string(),
            firmware_version: None,
            timestamp_device: None,
            rssi: None,
            altitude_m: None,
            free_heap: None,
            dht22_temperature_c: None,
            dht22_humidity_percent: None,
            bmp280_temperature_c: None,
            bmp280_pressure_pa: None,
        }
    }
}

/// A row ready to be inserted.
#[derive(Debug, Clone)]
pub struct NewMeasurement {
    // ---
    pub topic: String,
    /// Receipt time in epoch seconds, assigned by the ingester.
    pub timestamp_server: i64,
    pub payload: Payload,
}

/// A stored row of the `measurements` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Measurement {
    // ---
    pub id: i64,
    pub device_id: String,
    pub topic: String,
    pub dht22_temperature_c: Option<f64>,
    pub dht22_humidity_percent: Option<f64>,
    pub bmp280_temperature_c: Option<f64>,
    pub bmp280_pressure_pa: Option<f64>,
    pub timestamp_device: Option<i64>,
    pub timestamp_server: i64,
    pub firmware_version: Option<String>,
    pub rssi: Option<i64>,
    pub altitude_m: Option<f64>,
    pub free_heap: Option<i64>,
}

/// Connectivity classification derived from the age of the last message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Warning,
    Offline,
}

impl DeviceStatus {
    /// Seen less than this many seconds ago counts as online.
    pub const ONLINE_SECS: i64 = 60;
    /// Seen less than this many seconds ago counts as warning.
    pub const WARNING_SECS: i64 = 300;

    /// Classify by seconds elapsed since the device was last seen.
    pub fn from_age(seconds_ago: i64) -> Self {
        // ---
        if seconds_ago < Self::ONLINE_SECS {
            DeviceStatus::Online
        } else if seconds_ago < Self::WARNING_SECS {
            DeviceStatus::Warning
        } else {
            DeviceStatus::Offline
        }
    }
}
