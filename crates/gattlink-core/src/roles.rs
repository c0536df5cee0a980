//! Classification of discovered characteristics into RX and TX roles

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gatt::{GattCharacteristic, GattService};

/// Tie-break when several characteristics qualify for the same role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolePolicy {
    /// The last qualifying characteristic in discovery order wins
    #[default]
    LastWins,
    /// The first qualifying characteristic in discovery order wins
    FirstWins,
}

/// RX (device → us, notify/indicate) and TX (us → device, write) characteristics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRoles {
    pub rx: Option<GattCharacteristic>,
    pub tx: Option<GattCharacteristic>,
}

/// Select the target service by UUID
pub fn find_service(services: &[GattService], uuid: Uuid) -> Option<&GattService> {
    services.iter().find(|service| service.uuid == uuid)
}

/// Assign RX and TX by capability bits
///
/// A single characteristic may take both roles.
pub fn resolve_roles(characteristics: &[GattCharacteristic], policy: RolePolicy) -> ResolvedRoles {
    let mut roles = ResolvedRoles::default();
    for characteristic in characteristics {
        if characteristic.properties.can_push() {
            assign(&mut roles.rx, characteristic, policy);
        }
        if characteristic.properties.is_writable() {
            assign(&mut roles.tx, characteristic, policy);
        }
    }
    roles
}

fn assign(
    slot: &mut Option<GattCharacteristic>,
    candidate: &GattCharacteristic,
    policy: RolePolicy,
) {
    match policy {
        RolePolicy::LastWins => *slot = Some(candidate.clone()),
        RolePolicy::FirstWins => {
            if slot.is_none() {
                *slot = Some(candidate.clone());
            }
        }
    }
}
