//! Error types for data parsing in hrm-types.

use thiserror::Error;

/// Errors that can occur when decoding heart-rate sensor data.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in hrm-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The payload ended before a field declared by its flags.
    #[error("Insufficient bytes for {field}: expected at least {expected}, got {actual}")]
    InsufficientBytes {
        /// The field that could not be read.
        field: &'static str,
        /// Minimum payload length needed for the field.
        expected: usize,
        /// Actual payload length.
        actual: usize,
    },

    /// A field held a value outside its valid range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A device address could not be used as an identity.
    #[error("Invalid device address: {0:?}")]
    InvalidAddress(String),
}

/// Result type alias using hrm-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
