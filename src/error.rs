//! Error types for the peerlink protocol engine.

use thiserror::Error;

/// Errors that can occur while encoding, routing, or handling protocol
/// traffic.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid field '{key}': expected {expected}")]
    InvalidField {
        key: String,
        expected: &'static str,
    },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device not paired")]
    NotPaired,

    #[error("Device not connected")]
    NotConnected,

    #[error("Pairing error: {0}")]
    Pairing(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Whether the operation can be retried without operator involvement.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::Transport(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::NotConnected
        )
    }

    /// Whether resolving the error needs a user decision rather than a retry.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotPaired | ProtocolError::Configuration(_)
        )
    }

    /// Short message suitable for surfacing in a UI.
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotPaired => "Device is not paired. Pair the device first.".to_string(),
            ProtocolError::NotConnected => "Device is not reachable right now.".to_string(),
            ProtocolError::DeviceNotFound(id) => format!("Unknown device: {}", id),
            ProtocolError::Timeout(what) => format!("Timed out: {}", what),
            ProtocolError::Configuration(msg) => format!("Configuration problem: {}", msg),
            other => other.to_string(),
        }
    }
}
