//! Connection core for BLE heart-rate sensors.
//!
//! This crate discovers heart-rate sensors, keeps GATT sessions to any number
//! of them alive, and turns their notifications into [`HeartRateReading`]s.
//!
//! # Features
//!
//! - **Service matching**: standard Heart Rate service and the Garmin vendor variant
//! - **Connection state machine**: settle delay, service discovery, subscription
//! - **Fault recovery**: a bounded refresh/disconnect/close/reopen cycle on link faults
//! - **Multi-device manager**: one connection per sensor, aggregate state, listeners
//! - **Pluggable radio**: [`Scanner`] and [`Transport`] traits with a btleplug
//!   backend and scriptable mocks
//!
//! # Connection Lifecycle
//!
//! ```text
//! Idle -> Connecting -> ServiceDiscovery -> Subscribing -> Streaming
//!             ^                                              |
//!             +------------- Disconnecting <-----------------+
//!                                 |
//!                                 v
//!                             Terminated
//! ```
//!
//! A clean disconnect from the sensor terminates the connection. A faulted
//! one runs the recovery cycle, up to
//! [`ConnectionConfig::max_recovery_attempts`] times in a row.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hrm_core::{BtleplugScanner, BtleplugTransport, HeartRateManager, ManagerConfig, ManagerEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let scanner = Arc::new(BtleplugScanner::new(transport.adapter().clone()));
//!
//!     let manager = HeartRateManager::new(ManagerConfig::default(), transport)?;
//!     manager.init(scanner).await;
//!     let mut events = manager.subscribe();
//!     manager.start_scanning().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ManagerEvent::DeviceFound { identity, .. } => {
//!                 manager.connect_to(identity).await;
//!             }
//!             ManagerEvent::ValueChanged { reading } => {
//!                 println!("{}: {} bpm", reading.identity, reading.value);
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod manager;
pub mod matcher;
pub mod mock;
pub mod platform;
pub mod provider;
pub mod traits;

// Core exports
pub use config::{ConnectionConfig, ManagerConfig};
pub use connection::{ConnectionReport, DeviceConnection};
pub use error::{Error, Result};
pub use events::{ChannelListener, ListenerRegistry, ManagerEvent, ManagerListener};
pub use manager::{HeartRateManager, aggregate_state};
pub use mock::{MockBehavior, MockScanner, MockSession, MockTransport, SessionCall};
pub use platform::{BtleplugScanner, BtleplugSession, BtleplugTransport, first_adapter};
pub use provider::DeviceProviderFilter;
pub use traits::{GattSession, ScanEvent, Scanner, SessionHandle, Transport, TransportEvent};

// Re-export from hrm-types
pub use hrm_types::uuid as uuids;
pub use hrm_types::{
    ConnectionState, DeviceIdentity, DisconnectReason, DiscoveryRecord, GattCharacteristic,
    GattService, GattStatus, HeartRateMeasurement, HeartRateReading, LinkState, ManagerState,
    ScanFailureReason, ScanState, SensorContact,
};
