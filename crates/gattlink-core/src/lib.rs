//! Command-serialization and connection-lifecycle engine for BLE GATT links
//!
//! BLE stacks accept one GATT procedure at a time and report every result
//! asynchronously. This crate keeps a central-role client link correct under
//! those rules:
//!
//! - [`queue`] - single-flight FIFO command queue with bounded retry
//! - [`lifecycle`] - connect, bond, discover, subscribe, negotiate MTU, ready
//! - [`dispatcher`] - routes platform callbacks into the queue and lifecycle
//! - [`roles`] - picks the RX and TX characteristics of the target service
//! - [`transport`] - traits a platform layer implements
//! - `runtime` - Tokio task serializing requests, callbacks and timeouts
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gattlink_core::{
//!     gatt_event_channel, BondController, DeviceAddress, GattConnector, LinkConfig, LinkEvent,
//!     LinkRuntime,
//! };
//!
//! # async fn example(
//! #     connector: Arc<dyn GattConnector>,
//! #     bonds: Arc<dyn BondController>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! // The platform layer reports callbacks through the sender half
//! let (_gatt_tx, gatt_rx) = gatt_event_channel();
//! let (link, mut events) = LinkRuntime::spawn(LinkConfig::default(), connector, bonds, gatt_rx)?;
//!
//! link.connect(DeviceAddress::new("AA:BB:CC:DD:EE:FF")?).await?;
//! while let Some(event) = events.recv().await {
//!     if let LinkEvent::Ready { .. } = event {
//!         link.send(vec![0x01, 0x02]).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gatt;
pub mod lifecycle;
pub mod queue;
pub mod roles;
#[cfg(feature = "runtime")]
pub mod runtime;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use command::{Command, CommandAction, CommandKind};
pub use config::{LinkConfig, DEFAULT_SERVICE_UUID};
pub use dispatcher::GattEventDispatcher;
pub use error::{LinkError, Result, TransportRejected};
pub use events::{BondState, ConnectionStatus, GattCallback, GattEvent, LinkEvent};
pub use gatt::{
    CharProperties, CharacteristicRef, DescriptorRef, DeviceAddress, GattCharacteristic,
    GattService, GattStatus, WriteType, CLIENT_CHARACTERISTIC_CONFIG_UUID,
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, MAX_ATT_MTU,
    MIN_ATT_MTU,
};
pub use lifecycle::{AuditEntry, ConnectionLifecycle, LinkState};
pub use queue::{CommandQueue, DEFAULT_MAX_ATTEMPTS};
pub use roles::{find_service, resolve_roles, ResolvedRoles, RolePolicy};
pub use transport::{BondController, DispatchResult, GattConnector, GattTransport};
pub use uuid::Uuid;

#[cfg(feature = "runtime")]
pub use runtime::{
    gatt_event_channel, GattEventReceiver, GattEventSender, LinkEventReceiver, LinkHandle,
    LinkRuntime,
};
