//! GATT operations queued for single-flight execution

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::gatt::{CharacteristicRef, DescriptorRef, WriteType};
use crate::transport::{DispatchResult, GattTransport};

// ----------------------------------------------------------------------------
// Command Types
// ----------------------------------------------------------------------------

/// The GATT operation a command performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    Connect,
    DiscoverServices,
    WriteDescriptor {
        descriptor: DescriptorRef,
        value: Vec<u8>,
    },
    WriteCharacteristic {
        characteristic: CharacteristicRef,
        payload: Vec<u8>,
        write_type: WriteType,
    },
    ReadCharacteristic {
        characteristic: CharacteristicRef,
    },
    RequestMtu {
        size: u16,
    },
    Disconnect,
}

/// Payload-free discriminant of [`CommandAction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Connect,
    DiscoverServices,
    WriteDescriptor,
    WriteCharacteristic,
    ReadCharacteristic,
    RequestMtu,
    Disconnect,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Connect => "Connect",
            CommandKind::DiscoverServices => "DiscoverServices",
            CommandKind::WriteDescriptor => "WriteDescriptor",
            CommandKind::WriteCharacteristic => "WriteCharacteristic",
            CommandKind::ReadCharacteristic => "ReadCharacteristic",
            CommandKind::RequestMtu => "RequestMtu",
            CommandKind::Disconnect => "Disconnect",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl CommandAction {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandAction::Connect => CommandKind::Connect,
            CommandAction::DiscoverServices => CommandKind::DiscoverServices,
            CommandAction::WriteDescriptor { .. } => CommandKind::WriteDescriptor,
            CommandAction::WriteCharacteristic { .. } => CommandKind::WriteCharacteristic,
            CommandAction::ReadCharacteristic { .. } => CommandKind::ReadCharacteristic,
            CommandAction::RequestMtu { .. } => CommandKind::RequestMtu,
            CommandAction::Disconnect => CommandKind::Disconnect,
        }
    }
}

/// One queued GATT operation plus its retry bookkeeping
///
/// The action never changes after construction; only `attempt` does. A retry
/// re-executes the same `Command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    action: CommandAction,
    attempt: u32,
}

impl Command {
    pub fn new(action: CommandAction) -> Self {
        Self { action, attempt: 0 }
    }

    pub fn connect() -> Self {
        Self::new(CommandAction::Connect)
    }

    pub fn discover_services() -> Self {
        Self::new(CommandAction::DiscoverServices)
    }

    pub fn write_descriptor(descriptor: DescriptorRef, value: impl Into<Vec<u8>>) -> Self {
        Self::new(CommandAction::WriteDescriptor {
            descriptor,
            value: value.into(),
        })
    }

    pub fn write_characteristic(
        characteristic: CharacteristicRef,
        payload: impl Into<Vec<u8>>,
        write_type: WriteType,
    ) -> Self {
        Self::new(CommandAction::WriteCharacteristic {
            characteristic,
            payload: payload.into(),
            write_type,
        })
    }

    pub fn read_characteristic(characteristic: CharacteristicRef) -> Self {
        Self::new(CommandAction::ReadCharacteristic { characteristic })
    }

    pub fn request_mtu(size: u16) -> Self {
        Self::new(CommandAction::RequestMtu { size })
    }

    pub fn disconnect() -> Self {
        Self::new(CommandAction::Disconnect)
    }

    pub fn action(&self) -> &CommandAction {
        &self.action
    }

    pub fn kind(&self) -> CommandKind {
        self.action.kind()
    }

    /// Number of times this command has been dispatched
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn reset_attempts(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Issue the platform call for this command, stamped with dispatch `seq`
    pub(crate) fn execute(&self, transport: &dyn GattTransport, seq: u64) -> DispatchResult {
        match &self.action {
            CommandAction::Connect => transport.connect(seq),
            CommandAction::DiscoverServices => transport.discover_services(seq),
            CommandAction::WriteDescriptor { descriptor, value } => {
                transport.write_descriptor(seq, descriptor, value)
            }
            CommandAction::WriteCharacteristic {
                characteristic,
                payload,
                write_type,
            } => transport.write_characteristic(seq, characteristic, payload, *write_type),
            CommandAction::ReadCharacteristic { characteristic } => {
                transport.read_characteristic(seq, characteristic)
            }
            CommandAction::RequestMtu { size } => transport.request_mtu(seq, *size),
            CommandAction::Disconnect => transport.disconnect(seq),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            CommandAction::WriteDescriptor { descriptor, value } => {
                write!(f, "WriteDescriptor({} <- {})", descriptor, hex::encode(value))
            }
            CommandAction::WriteCharacteristic {
                characteristic,
                payload,
                ..
            } => write!(
                f,
                "WriteCharacteristic({} <- {} bytes)",
                characteristic,
                payload.len()
            ),
            CommandAction::ReadCharacteristic { characteristic } => {
                write!(f, "ReadCharacteristic({})", characteristic)
            }
            CommandAction::RequestMtu { size } => write!(f, "RequestMtu({})", size),
            other => write!(f, "{}", other.kind()),
        }
    }
}
