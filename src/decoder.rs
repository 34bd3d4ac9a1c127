//! ==============================================================================
//! decoder.rs - inbound telemetry decoding
//! ==============================================================================
//!
//! purpose:
//!     turns one raw mqtt payload from the device into a SensorSnapshot and
//!     stores it in the reading cache.
//!
//! payload:
//!     utf-8 json object, every key optional, unknown keys ignored:
//!
//!         {"humidity": 55, "temp": 21.5, "light": 300, "valve": "open"}
//!
//!     missing, null or non-numeric readings become 0. the valve is open
//!     only when it says "open"; anything else reads as closed.
//!
//! relationships:
//!     - called by: bus.rs (once per message, on the session task)
//!     - writes: cache.rs
//!
//! ==============================================================================

use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::cache::ReadingCache;
use crate::domain::{SensorSnapshot, ValveState};
use crate::error::DecodeError;

/// wire shape of a telemetry message
#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TelemetryPayload {
    #[serde(deserialize_with = "lenient_number")]
    pub humidity: f64,
    #[serde(rename = "temp", deserialize_with = "lenient_number")]
    pub temperature: f64,
    #[serde(rename = "light", deserialize_with = "lenient_number")]
    pub light_level: f64,
    #[serde(deserialize_with = "lenient_valve")]
    pub valve: ValveState,
}

impl TelemetryPayload {
    pub fn into_snapshot(self, observed_at: DateTime<Local>) -> SensorSnapshot {
        SensorSnapshot {
            humidity: self.humidity,
            temperature: self.temperature,
            light_level: self.light_level,
            valve: self.valve,
            observed_at: Some(observed_at),
        }
    }
}

fn lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_f64().unwrap_or(0.0))
}

fn lenient_valve<'de, D>(deserializer: D) -> Result<ValveState, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value.as_str() {
        Some(s) if s.trim().eq_ignore_ascii_case("open") => ValveState::Open,
        _ => ValveState::Closed,
    })
}

/// parse a raw payload without touching any state
pub fn decode(payload: &[u8]) -> Result<TelemetryPayload, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let value: Value = serde_json::from_str(text)?;
    // a derived struct would also accept a json array positionally
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    Ok(serde_json::from_value(value)?)
}

/// decode a payload and, if it is valid, make it the current snapshot
///
/// on error the cache is left exactly as it was.
pub async fn ingest(cache: &ReadingCache, payload: &[u8]) -> Result<SensorSnapshot, DecodeError> {
    let snapshot = decode(payload)?.into_snapshot(Local::now());
    cache.set(snapshot.clone()).await;
    Ok(snapshot)
}
