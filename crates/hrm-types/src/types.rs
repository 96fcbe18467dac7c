//! Core types for heart-rate sensor connections.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ParseError;
use crate::measurement::{HeartRateMeasurement, SensorContact};

/// Stable hardware address identifying one physical sensor.
///
/// On Linux/Windows this is the Bluetooth MAC address; on macOS it is the
/// CoreBluetooth peripheral UUID. Addresses are normalised to upper case so
/// that the same sensor always maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "String", into = "String"))]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Create an identity from an address, normalising its case.
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_uppercase())
    }

    /// The normalised address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceIdentity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(s))
    }
}

impl From<&str> for DeviceIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceIdentity {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<DeviceIdentity> for String {
    fn from(identity: DeviceIdentity) -> Self {
        identity.0
    }
}

impl AsRef<str> for DeviceIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a single device connection.
///
/// ```text
/// Idle -> Connecting -> ServiceDiscovery -> Subscribing -> Streaming
///             ^                                              |
///             +------------- Disconnecting <-----------------+
///                                 |
///                                 v
///                             Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConnectionState {
    /// Created but never started.
    #[default]
    Idle,
    /// Waiting for the transport link to come up.
    Connecting,
    /// Link is up; settling and enumerating services.
    ServiceDiscovery,
    /// Enabling heart-rate notifications.
    Subscribing,
    /// Notifications enabled; values are flowing.
    Streaming,
    /// Tearing the link down, either on request or ahead of a recovery attempt.
    Disconnecting,
    /// Finished. The connection will not change state again on its own.
    Terminated,
}

impl ConnectionState {
    /// Whether the connection has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Terminated
    }

    /// Whether the connection is part-way through establishing a session.
    #[must_use]
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::ServiceDiscovery
                | ConnectionState::Subscribing
        )
    }

    /// Whether `connect()` may start a new attempt from this state.
    #[must_use]
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Terminated)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ServiceDiscovery => "discovering services",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Coarse aggregate state of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ManagerState {
    /// No connections and no scan in progress.
    #[default]
    Disconnected,
    /// Scanning for sensors with no connections.
    Scanning,
    /// At least one connection is being set up, none is streaming.
    Connecting,
    /// At least one connection is streaming.
    Connected,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Disconnected => "disconnected",
            ManagerState::Scanning => "scanning",
            ManagerState::Connecting => "connecting",
            ManagerState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Reason why scanning cannot start.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[non_exhaustive]
pub enum ScanFailureReason {
    /// The application lacks the Bluetooth permission.
    MissingPermission,
    /// No Bluetooth LE radio is available.
    BluetoothUnsupported,
    /// The radio is present but switched off.
    BluetoothOff,
    /// The platform requires location services for scanning and they are off.
    LocationServiceOff,
    /// Any other failure reported by the scanner.
    Unknown(String),
}

impl fmt::Display for ScanFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPermission => write!(f, "Bluetooth permission not granted"),
            Self::BluetoothUnsupported => write!(f, "Bluetooth LE not supported"),
            Self::BluetoothOff => write!(f, "Bluetooth is turned off"),
            Self::LocationServiceOff => write!(f, "location services are turned off"),
            Self::Unknown(msg) => write!(f, "scan failed: {}", msg),
        }
    }
}

/// Whether the scanner is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ScanState {
    /// Not scanning.
    #[default]
    Idle,
    /// Scanning.
    Scanning,
}

/// Status code attached to transport callbacks.
///
/// Zero is success; everything else is a failure. Named constants cover the
/// codes the connection state machine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct GattStatus(pub u8);

impl GattStatus {
    /// Operation succeeded.
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    /// Link supervision timeout; the peer went away.
    pub const LINK_LOSS: GattStatus = GattStatus(0x08);
    /// Generic stack failure (the infamous 133).
    pub const GATT_ERROR: GattStatus = GattStatus(0x85);
    /// No connection was established in time.
    pub const CONNECTION_TIMEOUT: GattStatus = GattStatus(0x93);

    /// Whether the status reports success.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Link-layer state carried by a transport state-change callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LinkState {
    /// The link came up.
    Connected,
    /// The link went down.
    Disconnected,
}

/// Why a connection reached [`ConnectionState::Terminated`].
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The transport reported a clean disconnect.
    Clean,
    /// `disconnect()` was requested.
    UserRequested,
    /// The device exposes no heart-rate characteristic.
    UnsupportedDevice,
    /// Repeated link faults used up the recovery budget.
    RecoveryExhausted {
        /// Status of the last fault.
        status: GattStatus,
    },
    /// The transport could not open a session.
    ConnectFailed(String),
    /// A GATT operation failed in a way retrying cannot fix.
    ProtocolError(String),
    /// The transport dropped its event stream.
    TransportClosed,
}

impl DisconnectReason {
    /// Whether this termination was asked for, as opposed to a failure.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Clean | Self::UserRequested)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "disconnected by device"),
            Self::UserRequested => write!(f, "disconnect requested"),
            Self::UnsupportedDevice => write!(f, "device has no heart-rate characteristic"),
            Self::RecoveryExhausted { status } => {
                write!(f, "link lost (status {}), recovery exhausted", status)
            }
            Self::ConnectFailed(msg) => write!(f, "connection failed: {}", msg),
            Self::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            Self::TransportClosed => write!(f, "transport closed"),
        }
    }
}

/// A characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the owning service.
    pub service_uuid: Uuid,
}

/// A service found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of this service.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Build a service from its UUID and characteristic UUIDs.
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            characteristics: characteristics
                .into_iter()
                .map(|c| GattCharacteristic {
                    uuid: c,
                    service_uuid: uuid,
                })
                .collect(),
        }
    }
}

/// A raw advertising record delivered by a scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    /// Address of the advertiser.
    pub identity: DeviceIdentity,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Advertised service UUIDs; `None` when the record carried no service list.
    pub services: Option<Vec<Uuid>>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl DiscoveryRecord {
    /// Create a record with a service list.
    pub fn new(identity: impl Into<DeviceIdentity>, services: Vec<Uuid>) -> Self {
        Self {
            identity: identity.into(),
            name: None,
            services: Some(services),
            rssi: None,
        }
    }
}

/// One heart-rate value received from a sensor.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HeartRateReading {
    /// The sensor that sent the value.
    pub identity: DeviceIdentity,
    /// Heart rate in beats per minute.
    pub value: u16,
    /// Skin contact status.
    pub sensor_contact: SensorContact,
    /// Accumulated energy expended in kilojoules, if reported.
    pub energy_expended: Option<u16>,
    /// RR intervals in units of 1/1024 second.
    pub rr_intervals: Vec<u16>,
    /// When the notification was received.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub received_at: OffsetDateTime,
}

impl HeartRateReading {
    /// Build a reading from a decoded measurement.
    pub fn from_measurement(
        identity: DeviceIdentity,
        measurement: HeartRateMeasurement,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            identity,
            value: measurement.value,
            sensor_contact: measurement.sensor_contact,
            energy_expended: measurement.energy_expended,
            rr_intervals: measurement.rr_intervals,
            received_at,
        }
    }
}
