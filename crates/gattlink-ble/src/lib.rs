//! btleplug platform layer for gattlink
//!
//! Implements the engine's transport traits on top of btleplug so the same
//! link engine runs against real adapters on Linux, macOS and Windows:
//!
//! - [`BtleplugConnector`] locates peripherals and opens transports
//! - [`BtleplugTransport`] turns each GATT call into a background task that
//!   reports its completion on the engine's event channel
//! - [`DeviceScanner`] runs deduplicated scans
//! - [`OsManagedBonds`] stands in for bonding, which the OS performs

pub mod adapter;
pub mod bonds;
pub mod config;
pub mod connector;
pub mod convert;
pub mod error;
pub mod scanner;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use adapter::init_adapter;
pub use bonds::OsManagedBonds;
pub use config::BleConfig;
pub use connector::BtleplugConnector;
pub use error::{BleError, Result};
pub use scanner::{DeviceScanner, DiscoveredDevice, ScanDeduplicator, ScanResult};
pub use transport::BtleplugTransport;
