//! Error taxonomy
//!
//! Bus and transport failures are kept apart from the bridge's own errors so
//! callers can tell a flaky radio from a broken configuration.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by (or while talking to) the Bluetooth management daemon
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error("D-Bus connection error: {0}")]
    Connection(String),

    #[error("Unexpected reply from {path}: {detail}")]
    UnexpectedReply { path: String, detail: String },
}

impl BusError {
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            name: name.into(),
            message: message.into(),
        }
    }

    /// The human readable part of a remote error, if any
    pub fn message(&self) -> &str {
        match self {
            Self::Remote { message, .. } => message,
            Self::Connection(message) => message,
            Self::UnexpectedReply { detail, .. } => detail,
        }
    }

    /// StopDiscovery on an idle adapter
    pub fn is_no_discovery_started(&self) -> bool {
        self.message().contains("No discovery started")
    }

    /// StartDiscovery while the adapter's internal state is inconsistent
    pub fn is_operation_in_progress(&self) -> bool {
        self.message().contains("Operation already in progress")
    }

    /// StopNotify without a prior StartNotify
    pub fn is_no_notify_session(&self) -> bool {
        self.message().contains("No notify session started")
    }
}

/// Failure of the message transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to {topics:?}: {reason}")]
    Subscribe { topics: Vec<String>, reason: String },
}

/// Errors raised by the bridge itself
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Payload encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Exclusivity gate closed")]
    GateClosed,

    #[error("Timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        timeout: Duration,
        waiting_for: String,
    },

    #[error("Failed to connect to {device} after {attempts} attempts: {last_error}")]
    ConnectFailed {
        device: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Device {0} is not known to the adapter (out of range?)")]
    DeviceUnavailable(String),

    #[error("Characteristic {0} not found")]
    MissingCharacteristic(String),

    #[error("Unknown device type '{0}'")]
    UnknownDeviceType(String),

    #[error("Unknown service type '{0}'")]
    UnknownServiceType(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid command value: {0}")]
    InvalidCommand(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    pub fn timeout(timeout: Duration, waiting_for: impl Into<String>) -> Self {
        Self::Timeout {
            timeout,
            waiting_for: waiting_for.into(),
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
