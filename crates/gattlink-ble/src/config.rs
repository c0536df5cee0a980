//! BLE platform configuration

use std::time::Duration;

use gattlink_core::{MAX_ATT_MTU, MIN_ATT_MTU};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the btleplug platform layer
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Index into the adapters reported by the btleplug manager
    pub adapter_index: usize,
    /// How long a scan runs when looking for devices
    pub scan_duration: Duration,
    /// Only report devices advertising this service
    pub scan_service: Option<Uuid>,
    /// Maximum time for the link-layer connect call
    pub connect_timeout: Duration,
    /// MTU reported to the engine after an MTU request
    ///
    /// btleplug negotiates the MTU inside the OS stack and does not expose
    /// the result, so the default is the ATT minimum every link supports.
    /// Raise it only for platforms known to negotiate more.
    pub assumed_mtu: u16,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            scan_duration: Duration::from_secs(5),
            scan_service: None,
            connect_timeout: Duration::from_secs(10),
            assumed_mtu: MIN_ATT_MTU,
        }
    }
}

impl BleConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Set scan duration
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    pub fn with_scan_service(mut self, service: Option<Uuid>) -> Self {
        self.scan_service = service;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_assumed_mtu(mut self, mtu: u16) -> Self {
        self.assumed_mtu = mtu;
        self
    }

    /// MTU to report for a request of `requested` bytes
    ///
    /// Never more than was asked for, and clamped to the ATT limits.
    pub fn reported_mtu(&self, requested: u16) -> u16 {
        self.assumed_mtu
            .clamp(MIN_ATT_MTU, MAX_ATT_MTU)
            .min(requested)
            .max(MIN_ATT_MTU)
    }
}
