//! Platform capability traits
//!
//! The engine drives a platform BLE stack through these traits. Every
//! [`GattTransport`] method either accepts the request (returning `Ok`) and
//! later reports its completion as a [`GattCallback`](crate::GattCallback), or
//! rejects it synchronously with [`TransportRejected`].
//!
//! Completions echo the `seq` passed to the dispatching method and carry the
//! epoch the transport was opened with. Callbacks with any other identity are
//! discarded by the engine.

use std::sync::Arc;

use crate::error::{LinkError, TransportRejected};
use crate::gatt::{CharacteristicRef, DescriptorRef, DeviceAddress, WriteType};

/// Result of a synchronous dispatch
pub type DispatchResult = std::result::Result<(), TransportRejected>;

/// One GATT client connection to one device
pub trait GattTransport: Send + Sync {
    /// Start the link-layer connection; completes with a connection-state event
    fn connect(&self, seq: u64) -> DispatchResult;

    /// Completes with a services-discovered event
    fn discover_services(&self, seq: u64) -> DispatchResult;

    /// Toggle the local notification flag for a characteristic
    ///
    /// Synchronous: there is no completion event. Writing the remote CCCD is
    /// a separate queued descriptor write.
    fn set_notification(&self, characteristic: &CharacteristicRef, enabled: bool)
        -> DispatchResult;

    /// Completes with a descriptor-write event
    fn write_descriptor(&self, seq: u64, descriptor: &DescriptorRef, value: &[u8])
        -> DispatchResult;

    /// Completes with a characteristic-write event
    fn write_characteristic(
        &self,
        seq: u64,
        characteristic: &CharacteristicRef,
        payload: &[u8],
        write_type: WriteType,
    ) -> DispatchResult;

    /// Completes with a characteristic-read event carrying the value
    fn read_characteristic(&self, seq: u64, characteristic: &CharacteristicRef)
        -> DispatchResult;

    /// Completes with an MTU-changed event reporting the MTU actually in use
    fn request_mtu(&self, seq: u64, mtu: u16) -> DispatchResult;

    /// Completes with a connection-state event reporting disconnection
    fn disconnect(&self, seq: u64) -> DispatchResult;

    /// Release platform resources without reporting further events
    fn close(&self);
}

/// Opens transports to devices
pub trait GattConnector: Send + Sync {
    /// Open a transport whose callbacks are all stamped with `epoch`
    fn open(&self, address: &DeviceAddress, epoch: u64)
        -> Result<Arc<dyn GattTransport>, LinkError>;
}

/// Bond management supplied by the platform-integration layer
pub trait BondController: Send + Sync {
    fn is_bonded(&self, address: &DeviceAddress) -> bool;

    /// Ask the platform to forget the bond; returns whether removal started.
    /// The outcome is reported later as a bond-state event.
    fn remove_bond(&self, address: &DeviceAddress) -> bool;
}
