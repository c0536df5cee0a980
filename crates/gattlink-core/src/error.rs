//! Error types for the link engine

use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::LinkState;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by the link engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Invalid device address: {0:?}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Operation not allowed in state {state}")]
    InvalidState { state: LinkState },

    #[error("Link not ready (state: {state})")]
    NotReady { state: LinkState },

    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Transport handle is gone")]
    TransportGone,

    #[error("Failed to open transport: {0}")]
    TransportOpenFailed(String),

    #[error("Service {uuid} not found on device")]
    ServiceNotFound { uuid: Uuid },

    #[error("No {role} characteristic found in service {service}")]
    CharacteristicNotFound { role: &'static str, service: Uuid },

    #[error("Characteristic {uuid} not found in the target service")]
    UnknownCharacteristic { uuid: Uuid },

    #[error("Characteristic {uuid} is not readable")]
    NotReadable { uuid: Uuid },

    #[error("Link task stopped")]
    RuntimeStopped,
}

/// Synchronous rejection of a dispatch by the platform transport
///
/// The platform call itself refused the request (as opposed to accepting it
/// and later reporting a failed completion).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transport rejected request: {reason}")]
pub struct TransportRejected {
    pub reason: String,
}

impl TransportRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Result type for link operations
pub type Result<T> = std::result::Result<T, LinkError>;
