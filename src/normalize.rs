//! Defensive extraction of measurement fields from untrusted JSON payloads.
//!
//! Parsing can fail as a whole (bytes are not UTF-8 JSON). Once parsed, field
//! extraction is total: each field is looked up by its own key path and any
//! shape or type mismatch along that path yields `None` for that field only.

use serde_json::Value;

use crate::error::PayloadError;
use crate::models::{Payload, UNKNOWN_DEVICE};

// ---

/// Follow `path` through nested objects.
///
/// Returns `None` as soon as a step is not an object or lacks the key.
pub fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    // ---
    path.iter()
        .try_fold(root, |current, key| current.as_object()?.get(*key))
}

fn float_at(root: &Value, path: &[&str]) -> Option<f64> {
    lookup(root, path).and_then(Value::as_f64)
}

fn int_at(root: &Value, path: &[&str]) -> Option<i64> {
    lookup(root, path).and_then(Value::as_i64)
}

fn string_at(root: &Value, path: &[&str]) -> Option<String> {
    lookup(root, path).and_then(Value::as_str).map(str::to_owned)
}

/// Decode `raw` as UTF-8 JSON and extract the known fields.
pub fn normalize(raw: &[u8]) -> Result<Payload, PayloadError> {
    // ---
    let text = std::str::from_utf8(raw)?;
    let root: Value = serde_json::from_str(text)?;
    Ok(extract(&root))
}

/// Extract the known fields from an already parsed value.
pub fn extract(root: &Value) -> Payload {
    // ---
    Payload {
        device_id: string_at(root, &["device_id"]).unwrap_or_else(|| UNKNOWN_DEVICE.to_string()),
        firmware_version: string_at(root, &["fw"]),
        timestamp_device: int_at(root, &["ts_device"]),
        rssi: int_at(root, &["rssi"]),
        altitude_m: float_at(root, &["altitude_m"]),
        free_heap: int_at(root, &["free_heap"]),
        dht22_temperature_c: float_at(root, &["dht22", "temperature_c"]),
        dht22_humidity_percent: float_at(root, &["dht22", "humidity_percent"]),
        bmp280_temperature_c: float_at(root, &["bmp280", "temperature_c"]),
        bmp280_pressure_pa: float_at(root, &["bmp280", "pressure_pa"]),
    }
}
