//! Error types for beacon-core.
//!
//! Every command-scoped failure is reported to the host as
//! `{status: "error", code, message}`, where `code` is the stable taxonomy
//! name returned by [`Error::code`].
//!
//! # Taxonomy
//!
//! | Code | Raised by | Typical cause |
//! |------|-----------|---------------|
//! | `RadioOff` | Adapter gate | Bluetooth is powered off |
//! | `BusyPrompt` | Adapter gate | An enable prompt is already on screen |
//! | `NotSubscribed` | Registry | Stop for a key that was never started |
//! | `AlreadySubscribed` | Registry | Subscribe on a key that cannot be shared |
//! | `NotConnected` | Connection manager | Management call without a device |
//! | `Busy` | Connection manager | Another management call is in flight |
//! | `NotFound` | Connection manager | Descriptor matches no observed device |
//! | `InvalidUuid` | Dispatcher, connection manager | Malformed proximity UUID |
//! | `InvalidValue` | Dispatcher, connection manager | Major or minor of zero |
//! | `ConnectTimeout` | Connection manager | `Connecting` exceeded the configured bound |
//! | `AuthFailed` | Connection manager | Vendor authentication was refused |
//! | `WriteFailed` | Connection manager | The link rejected a settings write |
//! | `AlreadyAuthenticated` | Engine | Cloud credentials were already set |
//!
//! Scanner errors (`ScannerError`) are logged and broadcast but never surfaced
//! to a command responder.

use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

/// Errors raised by the beacon engine.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The Bluetooth radio is powered off.
    #[error("Bluetooth is powered off")]
    RadioOff,

    /// Another enable prompt is outstanding.
    #[error("Bluetooth state request already in progress")]
    BusyPrompt,

    /// No subscription exists for the key.
    #[error("{}", not_subscribed_message(kind, key))]
    NotSubscribed {
        /// Subscription kind ("ranging", "monitoring", ...).
        kind: &'static str,
        /// The key that was looked up.
        key: String,
    },

    /// A subscription already exists for the key.
    #[error("{kind} already subscribed: {key}")]
    AlreadySubscribed {
        /// Subscription kind.
        kind: &'static str,
        /// The conflicting key.
        key: String,
    },

    /// No device is connected.
    #[error("Not connected to a device")]
    NotConnected,

    /// A management operation is already in flight.
    #[error("Another device operation is in progress")]
    Busy,

    /// The descriptor did not match any observed device.
    #[error("Could not find device: {0}")]
    NotFound(String),

    /// Malformed proximity UUID.
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    /// A value outside the accepted range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The device did not finish connecting in time.
    #[error("Connecting to {mac} timed out after {duration:?}")]
    ConnectTimeout {
        /// Address of the device.
        mac: String,
        /// The configured bound.
        duration: Duration,
    },

    /// The device refused authentication.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The device rejected a settings write.
    #[error("Write of {field} failed: {reason}")]
    WriteFailed {
        /// Setting being written.
        field: &'static str,
        /// Failure reported by the link.
        reason: String,
    },

    /// Cloud credentials were already configured.
    #[error("Already authenticated to the cloud")]
    AlreadyAuthenticated,

    /// A command argument failed validation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Error from the Bluetooth backend.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The operation was abandoned by reset or teardown.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The scanner reported an error code.
    #[error("Scanner error code {code}")]
    Scanner {
        /// Backend-specific error code.
        code: i32,
    },
}

fn not_subscribed_message(kind: &str, key: &str) -> String {
    match kind {
        "ranging" => "Region not ranged".to_string(),
        "monitoring" => "Region not monitored".to_string(),
        _ => format!("{kind} not subscribed: {key}"),
    }
}

impl Error {
    /// Create a not-subscribed error.
    pub fn not_subscribed(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotSubscribed {
            kind,
            key: key.into(),
        }
    }

    /// Create a write failure for a setting.
    pub fn write_failed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            field,
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an argument validation error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Stable taxonomy name reported to hosts.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RadioOff => "RadioOff",
            Self::BusyPrompt => "BusyPrompt",
            Self::NotSubscribed { .. } => "NotSubscribed",
            Self::AlreadySubscribed { .. } => "AlreadySubscribed",
            Self::NotConnected => "NotConnected",
            Self::Busy => "Busy",
            Self::NotFound(_) => "NotFound",
            Self::InvalidUuid(_) => "InvalidUuid",
            Self::InvalidValue(_) => "InvalidValue",
            Self::ConnectTimeout { .. } => "ConnectTimeout",
            Self::AuthFailed(_) => "AuthFailed",
            Self::WriteFailed { .. } => "WriteFailed",
            Self::AlreadyAuthenticated => "AlreadyAuthenticated",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Bluetooth(_) => "Bluetooth",
            Self::Cancelled => "Cancelled",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::Scanner { .. } => "ScannerError",
        }
    }

    /// Host-visible error payload.
    pub fn to_payload(&self) -> Value {
        json!({
            "status": "error",
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

impl From<beacon_types::ParseError> for Error {
    fn from(err: beacon_types::ParseError) -> Self {
        match err {
            beacon_types::ParseError::InvalidUuid(s) => Error::InvalidUuid(s),
            beacon_types::ParseError::InvalidValue(msg) => Error::InvalidValue(msg),
            // Handle future ParseError variants (non_exhaustive)
            other => Error::InvalidArgument(other.to_string()),
        }
    }
}

/// Result type alias using beacon-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
