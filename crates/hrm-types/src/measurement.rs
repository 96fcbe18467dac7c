//! Heart Rate Measurement decoding (GATT characteristic 0x2A37).
//!
//! Every notification starts with a flags byte that declares the layout of
//! the rest of the payload:
//!
//! | Bit | Meaning |
//! |-----|---------|
//! | 0 | Value format: 0 = `u8`, 1 = `u16` little-endian |
//! | 1-2 | Sensor contact status |
//! | 3 | Energy expended field present (`u16`, kJ) |
//! | 4 | RR-interval fields present (`u16` each, 1/1024 s) |
//!
//! The value width is taken from bit 0 before anything else is read, so a
//! payload can never be decoded with the wrong width.

use core::time::Duration;

use bytes::Buf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

const FLAG_VALUE_U16: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

/// Resolution of RR-interval fields (1/1024 second).
pub const RR_INTERVAL_RESOLUTION: u32 = 1024;

/// Numeric width of the heart-rate value, as declared by the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ValueFormat {
    /// 8-bit unsigned value.
    Uint8,
    /// 16-bit unsigned little-endian value.
    Uint16,
}

impl ValueFormat {
    /// Read the value format from a flags byte.
    #[must_use]
    pub fn from_flags(flags: u8) -> Self {
        if flags & FLAG_VALUE_U16 != 0 {
            ValueFormat::Uint16
        } else {
            ValueFormat::Uint8
        }
    }

    /// Number of payload bytes the value occupies.
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            ValueFormat::Uint8 => 1,
            ValueFormat::Uint16 => 2,
        }
    }
}

/// Skin contact status reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SensorContact {
    /// The sensor does not report contact.
    #[default]
    NotSupported,
    /// Contact is supported but not currently detected.
    NotDetected,
    /// Contact is detected.
    Detected,
}

impl SensorContact {
    /// Read the contact status from a flags byte.
    #[must_use]
    pub fn from_flags(flags: u8) -> Self {
        match (
            flags & FLAG_CONTACT_SUPPORTED != 0,
            flags & FLAG_CONTACT_DETECTED != 0,
        ) {
            (false, _) => SensorContact::NotSupported,
            (true, false) => SensorContact::NotDetected,
            (true, true) => SensorContact::Detected,
        }
    }
}

/// A decoded Heart Rate Measurement notification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HeartRateMeasurement {
    /// Heart rate in beats per minute.
    pub value: u16,
    /// Width the value was encoded with.
    pub format: ValueFormat,
    /// Skin contact status.
    pub sensor_contact: SensorContact,
    /// Accumulated energy expended in kilojoules, if reported.
    pub energy_expended: Option<u16>,
    /// RR intervals in units of 1/1024 second, oldest first.
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    /// Decode a measurement from a raw notification payload.
    ///
    /// Trailing bytes that do not form a complete RR interval are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] if the payload is empty or
    /// shorter than the fields its flags declare.
    ///
    /// # Examples
    ///
    /// ```
    /// use hrm_types::HeartRateMeasurement;
    ///
    /// let m = HeartRateMeasurement::from_bytes(&[0x00, 72]).unwrap();
    /// assert_eq!(m.value, 72);
    ///
    /// let m = HeartRateMeasurement::from_bytes(&[0x01, 0x2C, 0x01]).unwrap();
    /// assert_eq!(m.value, 300);
    /// ```
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        if data.is_empty() {
            return Err(ParseError::InsufficientBytes {
                field: "flags",
                expected: 1,
                actual: 0,
            });
        }

        let mut buf = data;
        let flags = buf.get_u8();
        let format = ValueFormat::from_flags(flags);

        let mut needed = 1 + format.width();
        if buf.remaining() < format.width() {
            return Err(ParseError::InsufficientBytes {
                field: "heart rate value",
                expected: needed,
                actual: data.len(),
            });
        }
        let value = match format {
            ValueFormat::Uint8 => u16::from(buf.get_u8()),
            ValueFormat::Uint16 => buf.get_u16_le(),
        };

        let energy_expended = if flags & FLAG_ENERGY_EXPENDED != 0 {
            needed += 2;
            if buf.remaining() < 2 {
                return Err(ParseError::InsufficientBytes {
                    field: "energy expended",
                    expected: needed,
                    actual: data.len(),
                });
            }
            Some(buf.get_u16_le())
        } else {
            None
        };

        let mut rr_intervals = Vec::new();
        if flags & FLAG_RR_INTERVALS != 0 {
            while buf.remaining() >= 2 {
                rr_intervals.push(buf.get_u16_le());
            }
        }

        Ok(HeartRateMeasurement {
            value,
            format,
            sensor_contact: SensorContact::from_flags(flags),
            energy_expended,
            rr_intervals,
        })
    }

    /// RR intervals converted to durations.
    #[must_use]
    pub fn rr_durations(&self) -> Vec<Duration> {
        self.rr_intervals
            .iter()
            .map(|&raw| rr_to_duration(raw))
            .collect()
    }
}

/// Convert a raw RR interval (1/1024 s units) to a [`Duration`].
#[must_use]
pub fn rr_to_duration(raw: u16) -> Duration {
    Duration::from_micros(u64::from(raw) * 1_000_000 / u64::from(RR_INTERVAL_RESOLUTION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_u8_value_when_format_flag_clear() {
        let m = HeartRateMeasurement::from_bytes(&[0x00, 0x48]).unwrap();
        assert_eq!(m.value, 72);
        assert_eq!(m.format, ValueFormat::Uint8);
    }

    #[test]
    fn test_u16_value_when_format_flag_set() {
        // Same leading value byte, but the flag selects a 16-bit read
        let m = HeartRateMeasurement::from_bytes(&[0x01, 0x48, 0x01]).unwrap();
        assert_eq!(m.value, 0x0148);
        assert_eq!(m.format, ValueFormat::Uint16);
    }

    #[test]
    fn test_u8_ignores_following_byte() {
        let m = HeartRateMeasurement::from_bytes(&[0x00, 0x48, 0x01]).unwrap();
        assert_eq!(m.value, 72);
    }

    #[test]
    fn test_empty_payload() {
        let err = HeartRateMeasurement::from_bytes(&[]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InsufficientBytes { field: "flags", .. }
        ));
    }

    #[test]
    fn test_flags_only_payload() {
        let err = HeartRateMeasurement::from_bytes(&[0x00]).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientBytes {
                field: "heart rate value",
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn test_truncated_u16_value() {
        let err = HeartRateMeasurement::from_bytes(&[0x01, 0x48]).unwrap_err();
        assert!(err.to_string().contains("expected at least 3, got 2"));
    }

    #[test]
    fn test_sensor_contact_states() {
        assert_eq!(SensorContact::from_flags(0x00), SensorContact::NotSupported);
        assert_eq!(SensorContact::from_flags(0x02), SensorContact::NotSupported);
        assert_eq!(SensorContact::from_flags(0x04), SensorContact::NotDetected);
        assert_eq!(SensorContact::from_flags(0x06), SensorContact::Detected);
    }

    #[test]
    fn test_energy_expended() {
        let m = HeartRateMeasurement::from_bytes(&[0x08, 80, 0x10, 0x27]).unwrap();
        assert_eq!(m.value, 80);
        assert_eq!(m.energy_expended, Some(10_000));
    }

    #[test]
    fn test_energy_expended_truncated() {
        let err = HeartRateMeasurement::from_bytes(&[0x08, 80, 0x10]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InsufficientBytes {
                field: "energy expended",
                ..
            }
        ));
    }

    #[test]
    fn test_rr_intervals() {
        // Polar H10 style: contact detected, RR present, two intervals
        let m =
            HeartRateMeasurement::from_bytes(&[0x16, 60, 0x00, 0x04, 0x00, 0x02, 0xFF]).unwrap();
        assert_eq!(m.value, 60);
        assert_eq!(m.sensor_contact, SensorContact::Detected);
        assert_eq!(m.rr_intervals, vec![1024, 512]);
        assert_eq!(
            m.rr_durations(),
            vec![Duration::from_secs(1), Duration::from_millis(500)]
        );
    }

    #[test]
    fn test_rr_after_energy_and_u16_value() {
        let m = HeartRateMeasurement::from_bytes(&[0x19, 0x90, 0x00, 0x01, 0x00, 0x00, 0x03])
            .unwrap();
        assert_eq!(m.value, 0x90);
        assert_eq!(m.energy_expended, Some(1));
        assert_eq!(m.rr_intervals, vec![0x0300]);
    }

    #[test]
    fn test_rr_to_duration() {
        assert_eq!(rr_to_duration(0), Duration::ZERO);
        assert_eq!(rr_to_duration(1024), Duration::from_secs(1));
        assert_eq!(rr_to_duration(256), Duration::from_millis(250));
    }

    proptest! {
        #[test]
        fn prop_never_panics(data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let _ = HeartRateMeasurement::from_bytes(&data);
        }

        #[test]
        fn prop_width_follows_flag(flags in any::<u8>(), lo in any::<u8>(), hi in any::<u8>()) {
            // Mask out optional fields so only the value is present
            let flags = flags & 0x07;
            let m = HeartRateMeasurement::from_bytes(&[flags, lo, hi]).unwrap();
            if flags & 0x01 != 0 {
                prop_assert_eq!(m.value, u16::from_le_bytes([lo, hi]));
            } else {
                prop_assert_eq!(m.value, u16::from(lo));
            }
        }
    }
}
