//! Link engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LinkError;
use crate::gatt::{MAX_ATT_MTU, MIN_ATT_MTU};
use crate::queue::DEFAULT_MAX_ATTEMPTS;
use crate::roles::RolePolicy;

/// Default application service
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0xED310001_C889_5D66_AE38_A7A01230635A);

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for one link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Service holding the RX and TX characteristics
    pub service_uuid: Uuid,
    /// Dispatches per command before it is abandoned
    pub max_attempts: u32,
    /// MTU requested once notifications are set up
    pub mtu: u16,
    /// Wall-clock limit for one in-flight command; `None` waits forever
    pub command_timeout_ms: Option<u64>,
    /// Tie-break for role resolution
    pub role_policy: RolePolicy,
    /// Ask the platform to drop any existing bond before connecting
    pub remove_bond_on_connect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            mtu: MAX_ATT_MTU,
            command_timeout_ms: Some(10_000),
            role_policy: RolePolicy::LastWins,
            remove_bond_on_connect: false,
        }
    }
}

impl LinkConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuid = uuid;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_role_policy(mut self, policy: RolePolicy) -> Self {
        self.role_policy = policy;
        self
    }

    pub fn with_remove_bond_on_connect(mut self, enabled: bool) -> Self {
        self.remove_bond_on_connect = enabled;
        self
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.max_attempts == 0 {
            return Err(LinkError::InvalidConfiguration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(MIN_ATT_MTU..=MAX_ATT_MTU).contains(&self.mtu) {
            return Err(LinkError::InvalidConfiguration(format!(
                "mtu {} outside {}..={}",
                self.mtu, MIN_ATT_MTU, MAX_ATT_MTU
            )));
        }
        if self.command_timeout_ms == Some(0) {
            return Err(LinkError::InvalidConfiguration(
                "command_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.mtu, 517);
        assert_eq!(config.role_policy, RolePolicy::LastWins);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = LinkConfig::new()
            .with_max_attempts(0)
            .with_command_timeout(None);
        assert!(config.command_timeout().is_none());
        assert!(config.validate().is_err());

        let config = LinkConfig::new().with_mtu(20);
        assert!(config.validate().is_err());

        let config = LinkConfig::new()
            .with_mtu(247)
            .with_command_timeout(Some(Duration::from_secs(2)));
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(2)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{ "mtu": 247, "role_policy": "first_wins" }"#).unwrap();
        assert_eq!(config.mtu, 247);
        assert_eq!(config.role_policy, RolePolicy::FirstWins);
        assert_eq!(config.service_uuid, DEFAULT_SERVICE_UUID);
    }
}
