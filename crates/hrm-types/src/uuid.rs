//! Bluetooth UUIDs for heart-rate sensors.
//!
//! This module contains the GATT identifiers needed to find and subscribe to
//! heart-rate measurements, both the Bluetooth SIG assigned numbers and the
//! vendor-specific variants some wearables expose instead.

use uuid::{Uuid, uuid};

// --- Standard Heart Rate Profile ---

/// Heart Rate service (assigned number 0x180D).
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

/// Heart Rate Measurement characteristic (assigned number 0x2A37).
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

/// Body Sensor Location characteristic (assigned number 0x2A38).
pub const BODY_SENSOR_LOCATION: Uuid = uuid!("00002a38-0000-1000-8000-00805f9b34fb");

/// Client Characteristic Configuration descriptor (assigned number 0x2902).
///
/// Writing [`ENABLE_NOTIFICATION_VALUE`] to this descriptor turns on
/// notifications for the owning characteristic.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// Descriptor value that enables notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

// --- Garmin vendor variants ---

/// Garmin umbrella service advertised by some watches in heart-rate broadcast mode.
///
/// Only used to recognise advertising records; it never carries the
/// measurement characteristic itself.
pub const GARMIN_SERVICE: Uuid = uuid!("6a4e3e10-667b-11e3-949a-0800200c9a66");

/// Garmin heart-rate service.
pub const GARMIN_HEART_RATE_SERVICE: Uuid = uuid!("6a4e2500-667b-11e3-949a-0800200c9a66");

/// Garmin heart-rate measurement characteristic.
pub const GARMIN_HEART_RATE_MEASUREMENT: Uuid = uuid!("6a4e2501-667b-11e3-949a-0800200c9a66");

// --- Grouped lookups ---

/// Services that carry a heart-rate measurement characteristic.
pub const HEART_RATE_SERVICES: [Uuid; 2] = [HEART_RATE_SERVICE, GARMIN_HEART_RATE_SERVICE];

/// Characteristics that deliver heart-rate measurement notifications.
pub const HEART_RATE_CHARACTERISTICS: [Uuid; 2] =
    [HEART_RATE_MEASUREMENT, GARMIN_HEART_RATE_MEASUREMENT];

/// Service UUIDs that mark an advertising record as a heart-rate sensor.
pub const ADVERTISED_HEART_RATE_SERVICES: [Uuid; 3] =
    [HEART_RATE_SERVICE, GARMIN_HEART_RATE_SERVICE, GARMIN_SERVICE];
