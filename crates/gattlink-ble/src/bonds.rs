//! Bond handling for hosts where the OS owns pairing

use gattlink_core::{BondController, DeviceAddress};
use tracing::warn;

/// btleplug exposes no bonding API; pairing happens in the OS during connect.
///
/// Every device is reported as bonded and bond removal is never started.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsManagedBonds;

impl BondController for OsManagedBonds {
    fn is_bonded(&self, _address: &DeviceAddress) -> bool {
        true
    }

    fn remove_bond(&self, address: &DeviceAddress) -> bool {
        warn!(
            "Cannot remove bond for {}: pairing is managed by the operating system",
            address
        );
        false
    }
}
