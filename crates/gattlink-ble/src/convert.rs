//! Conversions between btleplug types and the link engine's GATT model

use btleplug::api::{self, BDAddr, PeripheralProperties};
use gattlink_core::{
    CharProperties, DeviceAddress, GattCharacteristic, GattService, WriteType,
    CLIENT_CHARACTERISTIC_CONFIG_UUID,
};

/// Convert a discovered btleplug service
///
/// btleplug yields characteristics ordered by UUID, which is the discovery
/// order role resolution sees.
pub fn to_gatt_service(service: &api::Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .iter()
            .map(to_gatt_characteristic)
            .collect(),
    }
}

/// Convert a btleplug characteristic
///
/// Some platforms hide the client configuration descriptor; it is added back
/// for any characteristic that can notify or indicate.
pub fn to_gatt_characteristic(characteristic: &api::Characteristic) -> GattCharacteristic {
    let properties = CharProperties::from_bits_retain(characteristic.properties.bits());
    let mut descriptors: Vec<_> = characteristic
        .descriptors
        .iter()
        .map(|d| d.uuid)
        .collect();
    if properties.can_push() && !descriptors.contains(&CLIENT_CHARACTERISTIC_CONFIG_UUID) {
        descriptors.push(CLIENT_CHARACTERISTIC_CONFIG_UUID);
    }

    GattCharacteristic {
        service: characteristic.service_uuid,
        uuid: characteristic.uuid,
        properties,
        descriptors,
    }
}

pub fn to_btleplug_write_type(write_type: WriteType) -> api::WriteType {
    match write_type {
        WriteType::WithResponse => api::WriteType::WithResponse,
        WriteType::WithoutResponse => api::WriteType::WithoutResponse,
    }
}

/// Address of an advertising device; `None` where the platform hides it
pub fn device_address(address: BDAddr) -> Option<DeviceAddress> {
    if address == BDAddr::default() {
        return None;
    }
    DeviceAddress::new(address.to_string()).ok()
}

pub fn properties_address(properties: &PeripheralProperties) -> Option<DeviceAddress> {
    device_address(properties.address)
}
