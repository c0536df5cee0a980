//! GATT attribute model shared by the engine and platform integrations
//!
//! These are plain value types: the engine never holds platform objects, only
//! UUID-based references that a [`GattTransport`](crate::GattTransport)
//! resolves against its own attribute cache.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LinkError;

// ----------------------------------------------------------------------------
// Well-known Attributes
// ----------------------------------------------------------------------------

/// Client Characteristic Configuration Descriptor (`0x2902`)
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value disabling both notifications and indications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Bytes of ATT header overhead in every write payload
pub const ATT_HEADER_LEN: usize = 3;

/// Smallest MTU every BLE link supports
pub const MIN_ATT_MTU: u16 = 23;

/// Largest MTU the ATT protocol allows
pub const MAX_ATT_MTU: u16 = 517;

// ----------------------------------------------------------------------------
// Device Identity
// ----------------------------------------------------------------------------

/// Hardware address of the remote device
///
/// The value is opaque to the engine. It is trimmed and upper-cased so that
/// `aa:bb:..` and `AA:BB:..` name the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, LinkError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(LinkError::InvalidAddress(raw.as_ref().to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a platform-formatted address
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DeviceAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ----------------------------------------------------------------------------
// Characteristic Properties
// ----------------------------------------------------------------------------

bitflags! {
    /// Characteristic property bit-set as carried in the characteristic declaration
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CharProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharProperties {
    pub fn is_readable(self) -> bool {
        self.contains(Self::READ)
    }

    /// Write with or without response
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn is_notifiable(self) -> bool {
        self.contains(Self::NOTIFY)
    }

    pub fn is_indicatable(self) -> bool {
        self.contains(Self::INDICATE)
    }

    /// Notify or indicate, i.e. the peripheral can push values
    pub fn can_push(self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }

    /// Write type to use when writing to a characteristic with these properties
    pub fn preferred_write_type(self) -> WriteType {
        if self.contains(Self::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        }
    }
}

impl fmt::Display for CharProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("NONE")
        } else {
            bitflags::parser::to_writer(self, f)
        }
    }
}

/// How a characteristic write is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

// ----------------------------------------------------------------------------
// Attribute Tree
// ----------------------------------------------------------------------------

/// A discovered primary service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// A discovered characteristic with its declared properties and descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProperties,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn reference(&self) -> CharacteristicRef {
        CharacteristicRef {
            service: self.service,
            uuid: self.uuid,
        }
    }

    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }

    /// Reference to this characteristic's CCCD, if it exposes one
    pub fn client_config(&self) -> Option<DescriptorRef> {
        self.has_descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID)
            .then(|| DescriptorRef {
                service: self.service,
                characteristic: self.uuid,
                uuid: CLIENT_CHARACTERISTIC_CONFIG_UUID,
            })
    }
}

/// Platform-independent handle naming one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.uuid)
    }
}

/// Platform-independent handle naming one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub uuid: Uuid,
}

impl DescriptorRef {
    pub fn characteristic_ref(&self) -> CharacteristicRef {
        CharacteristicRef {
            service: self.service,
            uuid: self.characteristic,
        }
    }

    pub fn is_client_config(&self) -> bool {
        self.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID
    }
}

impl fmt::Display for DescriptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.characteristic, self.uuid)
    }
}

// ----------------------------------------------------------------------------
// Completion Status
// ----------------------------------------------------------------------------

/// Status code reported with an asynchronous GATT completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const SUCCESS: Self = Self(0x00);
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    pub const REQUEST_NOT_SUPPORTED: Self = Self(0x06);
    pub const FAILURE: Self = Self(0x85);
    pub const CONNECTION_CONGESTED: Self = Self(0x8F);

    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "success",
            Self::READ_NOT_PERMITTED => "read not permitted",
            Self::WRITE_NOT_PERMITTED => "write not permitted",
            Self::INSUFFICIENT_AUTHENTICATION => "insufficient authentication",
            Self::REQUEST_NOT_SUPPORTED => "request not supported",
            Self::CONNECTION_CONGESTED => "connection congested",
            Self::FAILURE => "operation failed",
            _ => "unknown status",
        };
        write!(f, "{} (0x{:02X})", name, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalization() {
        let addr = DeviceAddress::new("  aa:bb:cc:dd:ee:ff ").unwrap();
        assert_eq!(addr.as_str(), "AA:BB:CC:DD:EE:FF");
        assert!(addr.matches("aa:bb:cc:dd:ee:ff"));
        assert!(DeviceAddress::new("   ").is_err());
    }

    #[test]
    fn test_property_predicates() {
        let props = CharProperties::NOTIFY | CharProperties::WRITE_WITHOUT_RESPONSE;
        assert!(props.is_notifiable());
        assert!(props.is_writable());
        assert!(!props.is_indicatable());
        assert!(!props.is_readable());
        assert_eq!(props.preferred_write_type(), WriteType::WithoutResponse);
        assert_eq!(
            CharProperties::WRITE.preferred_write_type(),
            WriteType::WithResponse
        );
    }

    #[test]
    fn test_property_display() {
        let props = CharProperties::READ | CharProperties::WRITE | CharProperties::NOTIFY;
        assert_eq!(props.to_string(), "READ | WRITE | NOTIFY");
        assert_eq!(CharProperties::empty().to_string(), "NONE");
        assert_eq!(
            CharProperties::from_bits_retain(0x0A),
            CharProperties::READ | CharProperties::WRITE
        );
    }

    #[test]
    fn test_properties_serialize_by_name() {
        let props = CharProperties::READ | CharProperties::NOTIFY;
        let json = serde_json::to_string(&props).unwrap();
        assert!(json.contains("NOTIFY"));
        let parsed: CharProperties = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, props);
    }

    #[test]
    fn test_client_config_lookup() {
        let service = Uuid::from_u128(1);
        let mut characteristic = GattCharacteristic {
            service,
            uuid: Uuid::from_u128(2),
            properties: CharProperties::NOTIFY,
            descriptors: Vec::new(),
        };
        assert!(characteristic.client_config().is_none());

        characteristic
            .descriptors
            .push(CLIENT_CHARACTERISTIC_CONFIG_UUID);
        let cccd = characteristic.client_config().unwrap();
        assert!(cccd.is_client_config());
        assert_eq!(cccd.characteristic_ref(), characteristic.reference());
    }

    #[test]
    fn test_cccd_uuid_string() {
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_status_display() {
        assert!(GattStatus::SUCCESS.is_success());
        assert!(!GattStatus::FAILURE.is_success());
        assert_eq!(
            GattStatus::INSUFFICIENT_AUTHENTICATION.to_string(),
            "insufficient authentication (0x05)"
        );
        assert_eq!(GattStatus(0x42).to_string(), "unknown status (0x42)");
    }
}
