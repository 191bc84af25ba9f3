//! Notification payload decoding.
//!
//! The sensor pushes a fixed-layout notification on its data characteristic:
//!
//! | Bytes | Meaning                                              |
//! |-------|------------------------------------------------------|
//! | 0-1   | Temperature, signed little-endian, hundredths of °C  |
//! | 2     | Relative humidity, unsigned, percent                 |
//!
//! Anything after byte 2 is ignored. Values are not range-checked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::acquisition::AcquisitionFailure;

/// Minimum payload length carrying a full reading.
pub const MIN_PAYLOAD_LEN: usize = 3;

/// A single temperature/humidity sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    temperature_celsius: f64,
    humidity_percent: u8,
    captured_at: DateTime<Utc>,
}

impl Reading {
    /// Build a reading from already-decoded values.
    ///
    /// Used by the storage layer when rehydrating rows; live readings come
    /// from [`parse_reading`].
    #[must_use]
    pub const fn new(
        temperature_celsius: f64,
        humidity_percent: u8,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            temperature_celsius,
            humidity_percent,
            captured_at,
        }
    }

    /// Temperature in degrees Celsius.
    #[must_use]
    pub const fn temperature_celsius(&self) -> f64 {
        self.temperature_celsius
    }

    /// Relative humidity in percent.
    #[must_use]
    pub const fn humidity_percent(&self) -> u8 {
        self.humidity_percent
    }

    /// When the notification carrying this reading was received.
    #[must_use]
    pub const fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// Decode a notification payload into a [`Reading`].
///
/// # Errors
///
/// Returns [`AcquisitionFailure::MalformedPayload`] if the payload is shorter
/// than [`MIN_PAYLOAD_LEN`] bytes.
pub fn parse_reading(
    payload: &[u8],
    captured_at: DateTime<Utc>,
) -> Result<Reading, AcquisitionFailure> {
    match payload {
        [t0, t1, humidity, ..] => {
            let raw = i16::from_le_bytes([*t0, *t1]);
            Ok(Reading::new(f64::from(raw) / 100.0, *humidity, captured_at))
        }
        _ => Err(AcquisitionFailure::MalformedPayload { len: payload.len() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-15T03:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_parse_reference_payload() {
        let reading = parse_reading(&[0x0A, 0x0B, 0x50], at()).unwrap();
        assert!((reading.temperature_celsius() - 28.26).abs() < 1e-9);
        assert_eq!(reading.humidity_percent(), 80);
        assert_eq!(reading.captured_at(), at());
    }

    #[test]
    fn test_parse_negative_temperature() {
        // -5.00 °C = -500 = 0xFE0C
        let reading = parse_reading(&[0x0C, 0xFE, 0x2A], at()).unwrap();
        assert!((reading.temperature_celsius() + 5.0).abs() < 1e-9);
        assert_eq!(reading.humidity_percent(), 42);
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let short = parse_reading(&[0x10, 0x09, 0x37], at()).unwrap();
        let long = parse_reading(&[0x10, 0x09, 0x37, 0xAA, 0xBB], at()).unwrap();
        assert_eq!(short, long);
    }

    #[test]
    fn test_parse_matches_formula_for_all_temperatures() {
        for raw in (i16::MIN..=i16::MAX).step_by(97) {
            let [lo, hi] = raw.to_le_bytes();
            let reading = parse_reading(&[lo, hi, 255], at()).unwrap();
            assert!((reading.temperature_celsius() - f64::from(raw) / 100.0).abs() < 1e-9);
            assert_eq!(reading.humidity_percent(), 255);
        }
    }

    #[test]
    fn test_parse_short_payload_is_malformed() {
        for payload in [&[][..], &[0x01][..], &[0x01, 0x02][..]] {
            let err = parse_reading(payload, at()).unwrap_err();
            assert!(matches!(
                err,
                AcquisitionFailure::MalformedPayload { len } if len == payload.len()
            ));
        }
    }

    #[test]
    fn test_parse_is_deterministic() {
        let payload = [0x34, 0x12, 0x10];
        assert_eq!(parse_reading(&payload, at()), parse_reading(&payload, at()));
    }
}
