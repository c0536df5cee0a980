//! Error types for the BLE platform layer

use gattlink_core::{DeviceAddress, LinkError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the btleplug platform layer
#[derive(Error, Debug)]
pub enum BleError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("No BLE adapter at index {index} ({available} available)")]
    AdapterIndexOutOfRange { index: usize, available: usize },

    #[error("Device {address} not found")]
    DeviceNotFound { address: DeviceAddress },

    #[error("Must be called from within a Tokio runtime")]
    NoRuntime,

    #[error("Bluetooth error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

impl From<BleError> for LinkError {
    fn from(err: BleError) -> Self {
        LinkError::TransportOpenFailed(err.to_string())
    }
}

/// Result type for BLE platform operations
pub type Result<T> = std::result::Result<T, BleError>;
