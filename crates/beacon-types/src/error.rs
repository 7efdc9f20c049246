//! Error types for data parsing in beacon-types.

use thiserror::Error;

/// Errors that can occur when parsing beacon identities and advertisement fields.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in beacon-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The string is not a canonical 128-bit UUID.
    #[error("Invalid UUID '{0}'")]
    InvalidUuid(String),

    /// The string is not a 48-bit MAC address.
    #[error("Invalid MAC address '{0}'")]
    InvalidMac(String),

    /// Not enough bytes to decode a frame.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Expected number of bytes.
        expected: usize,
        /// Actual number of bytes.
        actual: usize,
    },

    /// A field carried a value outside its valid range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using beacon-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
