//! Collaborator interfaces consumed by the connection core.
//!
//! The core never talks to a radio directly. A [`Scanner`] yields advertising
//! records and a [`Transport`] opens [`GattSession`]s; both push their
//! asynchronous callbacks into channels handed to them by the core. The
//! btleplug-backed implementations live in [`crate::platform`], scriptable
//! ones in [`crate::mock`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use hrm_types::{
    DeviceIdentity, DiscoveryRecord, GattCharacteristic, GattService, GattStatus, LinkState,
    ScanFailureReason, ScanState,
};

use crate::error::Result;

/// Event pushed by a scanner while it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// An advertising record was received.
    DeviceFound(DiscoveryRecord),
    /// The scan failed or was interrupted.
    Error(ScanFailureReason),
}

/// Sender half handed to [`Scanner::start`].
pub type ScanEventSender = mpsc::UnboundedSender<ScanEvent>;

/// Source of advertising records.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Start scanning, delivering events into `events` until [`Scanner::stop`].
    ///
    /// Starting an already running scanner replaces the event sink.
    async fn start(&self, events: ScanEventSender) -> Result<()>;

    /// Stop scanning. Stopping an idle scanner is a no-op.
    async fn stop(&self) -> Result<()>;

    /// Whether the scanner is running.
    fn state(&self) -> ScanState;

    /// Conditions that currently prevent scanning; empty when scanning is allowed.
    async fn can_scan(&self) -> Vec<ScanFailureReason>;
}

/// Callback delivered by a GATT session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link came up or went down.
    StateChanged {
        /// Status of the transition.
        status: GattStatus,
        /// New link state.
        link: LinkState,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// Status of the discovery.
        status: GattStatus,
        /// Services found; empty on failure.
        services: Vec<GattService>,
    },
    /// The notification descriptor write finished.
    DescriptorWritten {
        /// Characteristic whose descriptor was written.
        characteristic: GattCharacteristic,
        /// Status of the write.
        status: GattStatus,
    },
    /// A characteristic value notification arrived.
    ValueChanged {
        /// Characteristic that changed.
        characteristic: GattCharacteristic,
        /// Raw payload.
        value: Vec<u8>,
    },
}

/// Sender half handed to [`Transport::open`].
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half owned by a connection worker.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// One open GATT session to a single device.
///
/// Requests return as soon as they are issued; their outcome arrives later as
/// a [`TransportEvent`] on the sender given to [`Transport::open`].
#[async_trait]
pub trait GattSession: Send + Sync {
    /// Request service discovery.
    async fn discover_services(&self) -> Result<()>;

    /// Enable notifications on a characteristic by writing its configuration descriptor.
    async fn enable_notifications(&self, characteristic: &GattCharacteristic) -> Result<()>;

    /// Request a link-level disconnect.
    async fn disconnect(&self) -> Result<()>;

    /// Release the session. No events are delivered afterwards.
    async fn close(&self);

    /// Invalidate any cached service table before a reconnect.
    ///
    /// Returns whether the stack performed a refresh. Stacks without a
    /// service cache return `false`.
    async fn refresh_cache(&self) -> bool;
}

/// Shared handle to an open session.
pub type SessionHandle = Arc<dyn GattSession>;

/// Factory for GATT sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin connecting to `identity`.
    ///
    /// The returned session is not yet connected; a
    /// [`TransportEvent::StateChanged`] reports the outcome.
    async fn open(
        &self,
        identity: &DeviceIdentity,
        events: TransportEventSender,
    ) -> Result<SessionHandle>;
}
