//! ==============================================================================
//! domain.rs - sensor snapshot and valve state
//! ==============================================================================
//!
//! purpose:
//!     the data the bridge carries between the bus and the http side.
//!     a SensorSnapshot is the complete latest known device state; it is
//!     replaced as a whole, never patched field by field.
//!
//! relationships:
//!     - produced by: decoder.rs (from inbound telemetry payloads)
//!     - stored by: cache.rs
//!     - rendered by: gateway.rs
//!
//! ==============================================================================

use chrono::{DateTime, Local};
use serde::Serialize;

/// wall clock format used for every timestamp the api hands out
pub const CLOCK_FORMAT: &str = "%H:%M:%S";

/// render a local time the way the api reports it (e.g. "14:03:27")
pub fn clock_time(at: &DateTime<Local>) -> String {
    at.format(CLOCK_FORMAT).to_string()
}

/// state of the watering valve as reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveState {
    Open,
    #[default]
    Closed,
}

impl ValveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValveState::Open => "open",
            ValveState::Closed => "closed",
        }
    }
}

/// latest decoded device state
///
/// the default value is the start-up snapshot: all readings zero, valve
/// closed, nothing observed yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSnapshot {
    /// relative humidity as sent by the device
    pub humidity: f64,
    /// temperature as sent by the device (payload key "temp")
    pub temperature: f64,
    /// raw light level (payload key "light")
    pub light_level: f64,
    pub valve: ValveState,
    /// when the bridge processed the message; None until the first message
    pub observed_at: Option<DateTime<Local>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_snapshot_is_empty() {
        let snapshot = SensorSnapshot::default();
        assert_eq!(snapshot.humidity, 0.0);
        assert_eq!(snapshot.temperature, 0.0);
        assert_eq!(snapshot.light_level, 0.0);
        assert_eq!(snapshot.valve, ValveState::Closed);
        assert!(snapshot.observed_at.is_none());
    }

    #[test]
    fn test_valve_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ValveState::Open).unwrap(), "\"open\"");
        assert_eq!(serde_json::to_string(&ValveState::Closed).unwrap(), "\"closed\"");
        assert_eq!(ValveState::Open.as_str(), "open");
    }

    #[test]
    fn test_clock_time_format() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 7, 4, 9).unwrap();
        assert_eq!(clock_time(&at), "07:04:09");
    }
}
