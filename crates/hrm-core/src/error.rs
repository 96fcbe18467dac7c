//! Error types for hrm-core.
//!
//! Only failures that cross the component boundary appear here. Transient
//! link faults are absorbed by the connection state machine and never
//! surface as an [`Error`]; they end up as a
//! [`DisconnectReason`](hrm_types::DisconnectReason) once recovery gives up.
//!
//! | Error | Category | Recovery |
//! |-------|----------|----------|
//! | [`Error::ScanUnavailable`] | Environmental | User action (enable radio, grant permission) |
//! | [`Error::Bluetooth`] | Environmental / transient | Retry later |
//! | [`Error::NotInitialized`] | Usage | Call `init()` first |
//! | [`Error::InvalidConfig`] | Usage | Fix configuration and restart |
//! | [`Error::NoAdapter`] | Environmental | Plug in or enable a Bluetooth adapter |
//! | [`Error::Timeout`] | Transient | Reported as a failed connect |
//! | [`Error::Parse`] | Protocol | Payload dropped, not retried |

use std::time::Duration;

use thiserror::Error;

use hrm_types::{ParseError, ScanFailureReason};

/// Errors that can occur while scanning for or talking to heart-rate sensors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// A manager operation was called before `init()` or after `destroy()`.
    #[error("Manager not initialized: call init() first")]
    NotInitialized,

    /// Scanning is blocked by the environment.
    #[error("Scanning unavailable: {}", format_reasons(.0))]
    ScanUnavailable(Vec<ScanFailureReason>),

    /// No Bluetooth adapter is available on this machine.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// Device not known to the transport.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation attempted on a session that is not connected.
    #[error("Not connected to device")]
    NotConnected,

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Data received from the device made no sense.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Failed to decode a notification payload.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The transport rejected a request.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn format_reasons(reasons: &[ScanFailureReason]) -> String {
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(identifier.into())
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias using hrm-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
