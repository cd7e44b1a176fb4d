//! Telemetry reading published by the sensor device
//!
//! One JSON object per message:
//!
//! ```json
//! { "timestamp": 1000, "co2_1": 612, "co2_2": 598,
//!   "wifi_rssi": -61, "heap_free": 182344, "device": "esp32-co2-01" }
//! ```
//!
//! A negative `co2_1`/`co2_2` means the sensor on that channel failed to read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One telemetry sample from the sensor device
///
/// # Examples
/// ```
/// use co2_telemetry::protocol::Reading;
///
/// let reading = Reading::decode(
///     br#"{"timestamp":1000,"co2_1":1500,"co2_2":-1,"wifi_rssi":-60,"heap_free":1024,"device":"esp32"}"#,
/// ).unwrap();
///
/// assert_eq!(reading.max_valid_co2(), Some(1500));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reading {
    /// Seconds since the Unix epoch, as reported by the device
    pub timestamp: i64,
    /// First CO2 channel in ppm (negative = sensor read failed)
    pub co2_1: i32,
    /// Second CO2 channel in ppm (negative = sensor read failed)
    pub co2_2: i32,
    /// WiFi signal strength in dBm
    pub wifi_rssi: i32,
    /// Free heap on the device in bytes
    pub heap_free: u64,
    /// Device identifier
    pub device: String,
}

impl Reading {
    /// Decode a reading from a raw MQTT payload
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        serde_json::from_slice(payload).map_err(DecodeError::Json)
    }

    /// Channels that produced a valid (non-negative) measurement
    pub fn valid_channels(&self) -> impl Iterator<Item = i32> {
        [self.co2_1, self.co2_2].into_iter().filter(|v| *v >= 0)
    }

    /// Highest valid CO2 value, or `None` when both channels failed
    pub fn max_valid_co2(&self) -> Option<i32> {
        self.valid_channels().max()
    }

    /// Device timestamp as a UTC date-time, if representable
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// Reasons an inbound payload could not be turned into a [`Reading`]
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Empty payload")]
    EmptyPayload,
    #[error("Malformed reading: {0}")]
    Json(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(co2_1: i32, co2_2: i32) -> Reading {
        Reading {
            timestamp: 1000,
            co2_1,
            co2_2,
            wifi_rssi: -60,
            heap_free: 180_000,
            device: "esp32-co2-01".to_string(),
        }
    }

    #[test]
    fn test_decode_device_payload() {
        let payload = br#"{"timestamp":1700000000,"co2_1":612,"co2_2":598,"wifi_rssi":-61,"heap_free":182344,"device":"esp32-co2-01"}"#;

        let decoded = Reading::decode(payload).unwrap();

        assert_eq!(decoded.timestamp, 1_700_000_000);
        assert_eq!(decoded.co2_1, 612);
        assert_eq!(decoded.co2_2, 598);
        assert_eq!(decoded.wifi_rssi, -61);
        assert_eq!(decoded.heap_free, 182_344);
        assert_eq!(decoded.device, "esp32-co2-01");
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let payload = br#"{"timestamp":1,"co2_1":400,"co2_2":410,"wifi_rssi":-50,"heap_free":1,"device":"d","firmware":"1.2.0"}"#;
        assert!(Reading::decode(payload).is_ok());
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(matches!(
            Reading::decode(b""),
            Err(DecodeError::EmptyPayload)
        ));
        assert!(matches!(
            Reading::decode(b"not json"),
            Err(DecodeError::Json(_))
        ));
        // Missing device field
        assert!(Reading::decode(br#"{"timestamp":1,"co2_1":1,"co2_2":1,"wifi_rssi":1,"heap_free":1}"#).is_err());
        // Wrong type for co2_1
        assert!(Reading::decode(br#"{"timestamp":1,"co2_1":"high","co2_2":1,"wifi_rssi":1,"heap_free":1,"device":"d"}"#).is_err());
    }

    #[test]
    fn test_max_valid_co2() {
        assert_eq!(reading(1500, 400).max_valid_co2(), Some(1500));
        assert_eq!(reading(400, 1500).max_valid_co2(), Some(1500));
        assert_eq!(reading(-1, 700).max_valid_co2(), Some(700));
        assert_eq!(reading(700, -1).max_valid_co2(), Some(700));
        assert_eq!(reading(-1, -1).max_valid_co2(), None);
        assert_eq!(reading(0, -5).max_valid_co2(), Some(0));
    }

    #[test]
    fn test_recorded_at() {
        let at = reading(1, 1).recorded_at().unwrap();
        assert_eq!(at.timestamp(), 1000);
    }

    #[test]
    fn test_serialized_field_names_match_wire_format() {
        let json = serde_json::to_value(reading(500, 510)).unwrap();
        for field in ["timestamp", "co2_1", "co2_2", "wifi_rssi", "heap_free", "device"] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }
}
