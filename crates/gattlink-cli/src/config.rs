//! gattlink CLI configuration
//!
//! Loaded from a TOML file; every field is optional and falls back to its
//! default:
//!
//! ```toml
//! adapter_index = 0
//! connect_timeout_secs = 10
//! on_ready_payload = "0102"
//!
//! [link]
//! service_uuid = "ed310001-c889-5d66-ae38-a7a01230635a"
//! max_attempts = 5
//! mtu = 517
//! role_policy = "last_wins"
//!
//! [scan]
//! seconds = 5
//! filter_service = true
//! ```

use std::path::Path;
use std::time::Duration;

use gattlink_ble::BleConfig;
use gattlink_core::LinkConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Index into the adapters reported by the platform
    pub adapter_index: usize,
    /// Maximum time for the link-layer connect call
    pub connect_timeout_secs: u64,
    /// Hex payload sent as soon as the link is ready
    pub on_ready_payload: Option<String>,
    pub link: LinkConfig,
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub seconds: u64,
    /// Only report devices advertising the link service
    pub filter_service: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            seconds: 5,
            filter_service: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            connect_timeout_secs: 10,
            on_ready_payload: None,
            link: LinkConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// Loading
// ----------------------------------------------------------------------------

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        if self.connect_timeout_secs == 0 {
            return Err(CliError::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(payload) = &self.on_ready_payload {
            parse_hex_payload(payload)?;
        }
        Ok(())
    }

    /// Platform-layer settings derived from this configuration
    pub fn ble_config(&self) -> BleConfig {
        let scan_service = self.scan.filter_service.then_some(self.link.service_uuid);
        BleConfig::new()
            .with_adapter_index(self.adapter_index)
            .with_scan_duration(Duration::from_secs(self.scan.seconds))
            .with_scan_service(scan_service)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn ready_payload(&self) -> Result<Option<Vec<u8>>> {
        self.on_ready_payload
            .as_deref()
            .map(parse_hex_payload)
            .transpose()
    }
}

/// Parse a hex payload, tolerating spaces, colons and a `0x` prefix
pub fn parse_hex_payload(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if digits.is_empty() {
        return Err(CliError::Config("payload is empty".to_string()));
    }
    Ok(hex::decode(digits)?)
}
