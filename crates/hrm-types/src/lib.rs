//! Platform-agnostic types for BLE heart-rate monitors.
//!
//! This crate provides the data model shared by the connection core
//! (hrm-core) and its front-ends.
//!
//! # Features
//!
//! - Device identities, connection and manager states
//! - Heart Rate Measurement decoding (GATT 0x2A37)
//! - UUID constants for the standard and vendor heart-rate services
//! - Error types for data parsing
//!
//! # Example
//!
//! ```
//! use hrm_types::{DeviceIdentity, HeartRateMeasurement};
//!
//! let id: DeviceIdentity = "c4:7c:8d:6a:0f:11".parse().unwrap();
//! assert_eq!(id.as_str(), "C4:7C:8D:6A:0F:11");
//!
//! let m = HeartRateMeasurement::from_bytes(&[0x00, 64]).unwrap();
//! assert_eq!(m.value, 64);
//! ```

pub mod error;
pub mod measurement;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use measurement::{HeartRateMeasurement, SensorContact, ValueFormat};
pub use types::{
    ConnectionState, DeviceIdentity, DisconnectReason, DiscoveryRecord, GattCharacteristic,
    GattService, GattStatus, HeartRateReading, LinkState, ManagerState, ScanFailureReason,
    ScanState,
};
pub use uuid as uuids;
