//! Inbound hardware events and outbound link events

use std::fmt;

use uuid::Uuid;

use crate::command::CommandKind;
use crate::error::LinkError;
use crate::gatt::{CharacteristicRef, DescriptorRef, GattService, GattStatus};
use crate::lifecycle::LinkState;

// ----------------------------------------------------------------------------
// Hardware Events
// ----------------------------------------------------------------------------

/// Link-layer connection state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Bond state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Asynchronous callback from the platform BLE stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged {
        status: GattStatus,
        state: ConnectionStatus,
    },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<GattService>,
    },
    DescriptorWritten {
        status: GattStatus,
        descriptor: DescriptorRef,
    },
    CharacteristicWritten {
        status: GattStatus,
        characteristic: CharacteristicRef,
    },
    CharacteristicRead {
        status: GattStatus,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    MtuChanged {
        status: GattStatus,
        mtu: u16,
    },
    /// Unsolicited notification or indication
    CharacteristicChanged {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    BondStateChanged(BondState),
}

impl GattEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GattEvent::ConnectionStateChanged { .. } => "ConnectionStateChanged",
            GattEvent::ServicesDiscovered { .. } => "ServicesDiscovered",
            GattEvent::DescriptorWritten { .. } => "DescriptorWritten",
            GattEvent::CharacteristicWritten { .. } => "CharacteristicWritten",
            GattEvent::CharacteristicRead { .. } => "CharacteristicRead",
            GattEvent::MtuChanged { .. } => "MtuChanged",
            GattEvent::CharacteristicChanged { .. } => "CharacteristicChanged",
            GattEvent::BondStateChanged(_) => "BondStateChanged",
        }
    }

    /// Whether the event originates from a specific transport
    ///
    /// Bond changes come from the platform's bond manager and outlive any
    /// single transport.
    pub fn is_transport_event(&self) -> bool {
        !matches!(self, GattEvent::BondStateChanged(_))
    }
}

/// A [`GattEvent`] plus the identity of whatever produced it
///
/// `epoch` names the transport (assigned when it was opened) and `seq` the
/// dispatch a completion answers. Unsolicited events carry no `seq`; bond
/// events carry neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCallback {
    pub epoch: Option<u64>,
    pub seq: Option<u64>,
    pub event: GattEvent,
}

impl GattCallback {
    /// Completion of the dispatch stamped `seq` on transport `epoch`
    pub fn completion(epoch: u64, seq: u64, event: GattEvent) -> Self {
        Self {
            epoch: Some(epoch),
            seq: Some(seq),
            event,
        }
    }

    /// Event raised by transport `epoch` without a dispatch to answer
    pub fn unsolicited(epoch: u64, event: GattEvent) -> Self {
        Self {
            epoch: Some(epoch),
            seq: None,
            event,
        }
    }

    /// Event from the platform itself rather than any transport
    pub fn platform(event: GattEvent) -> Self {
        Self {
            epoch: None,
            seq: None,
            event,
        }
    }
}

// ----------------------------------------------------------------------------
// Application Events
// ----------------------------------------------------------------------------

/// Event delivered to the application layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StateChanged { from: LinkState, to: LinkState },
    /// Setup finished; `send` is now accepted
    Ready { mtu: u16 },
    PayloadReceived {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Result of a requested characteristic read
    ValueRead {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// A command was abandoned at the retry ceiling; the state is unchanged
    RetryExhausted { action: CommandKind, attempts: u32 },
    /// Setup cannot continue (missing service or characteristic)
    SetupStalled { error: LinkError },
    /// The transport disappeared with work pending
    TransportGone,
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::StateChanged { from, to } => write!(f, "state {} -> {}", from, to),
            LinkEvent::Ready { mtu } => write!(f, "ready (mtu {})", mtu),
            LinkEvent::PayloadReceived {
                characteristic,
                value,
            } => write!(f, "received {} from {}", hex::encode_upper(value), characteristic),
            LinkEvent::ValueRead {
                characteristic,
                value,
            } => write!(f, "read {} from {}", hex::encode_upper(value), characteristic),
            LinkEvent::RetryExhausted { action, attempts } => {
                write!(f, "{} abandoned after {} attempts", action, attempts)
            }
            LinkEvent::SetupStalled { error } => write!(f, "setup stalled: {}", error),
            LinkEvent::TransportGone => f.write_str("transport gone"),
        }
    }
}
