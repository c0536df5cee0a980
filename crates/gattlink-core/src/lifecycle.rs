//! Connection lifecycle state machine
//!
//! Sequences link setup (connect → bond wait → discover services → resolve
//! roles → subscribe → negotiate MTU → ready). Every forward step is taken in
//! response to a completion event routed here by the
//! [`GattEventDispatcher`](crate::GattEventDispatcher); the lifecycle itself
//! never blocks.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::{Command, CommandKind};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::events::LinkEvent;
use crate::gatt::{
    CharacteristicRef, DescriptorRef, DeviceAddress, GattCharacteristic, GattService,
    ATT_HEADER_LEN, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, MIN_ATT_MTU,
};
use crate::queue::CommandQueue;
use crate::roles::{find_service, resolve_roles};
use crate::transport::{BondController, GattConnector, GattTransport};

/// Transitions kept for inspection
const AUDIT_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Link State
// ----------------------------------------------------------------------------

/// Externally observable macro-state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    ServicesDiscovered,
    Ready,
    Disconnecting,
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "Disconnected",
            LinkState::Connecting => "Connecting",
            LinkState::Connected => "Connected",
            LinkState::ServicesDiscovered => "ServicesDiscovered",
            LinkState::Ready => "Ready",
            LinkState::Disconnecting => "Disconnecting",
        }
    }

    pub fn can_send(&self) -> bool {
        matches!(self, LinkState::Ready)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub from: LinkState,
    pub to: LinkState,
    pub trigger: &'static str,
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// Per-connection state, alive from `connect` until teardown
struct Connection {
    address: DeviceAddress,
    bonded: bool,
    /// Transport reported the link-layer connection
    link_up: bool,
    transport: Option<Arc<dyn GattTransport>>,
    /// Identity stamped on every callback from `transport`
    epoch: Option<u64>,
    service: Option<Uuid>,
    /// Characteristics of the target service
    characteristics: Vec<GattCharacteristic>,
    rx: Option<GattCharacteristic>,
    tx: Option<GattCharacteristic>,
    mtu: Option<u16>,
    /// CCCD writes still outstanding before the MTU request
    pending_subscriptions: usize,
}

impl Connection {
    fn new(address: DeviceAddress, bonded: bool) -> Self {
        Self {
            address,
            bonded,
            link_up: false,
            transport: None,
            epoch: None,
            service: None,
            characteristics: Vec::new(),
            rx: None,
            tx: None,
            mtu: None,
            pending_subscriptions: 0,
        }
    }

    fn clear_roles(&mut self) {
        self.service = None;
        self.characteristics.clear();
        self.rx = None;
        self.tx = None;
        self.mtu = None;
        self.pending_subscriptions = 0;
    }
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

/// Owns one connection, its transport handle and its command queue
pub struct ConnectionLifecycle {
    config: LinkConfig,
    connector: Arc<dyn GattConnector>,
    bonds: Arc<dyn BondController>,
    queue: CommandQueue,
    state: LinkState,
    connection: Option<Connection>,
    /// Last epoch handed to the connector
    last_epoch: u64,
    events: Vec<LinkEvent>,
    audit: VecDeque<AuditEntry>,
}

impl ConnectionLifecycle {
    pub fn new(
        config: LinkConfig,
        connector: Arc<dyn GattConnector>,
        bonds: Arc<dyn BondController>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            queue: CommandQueue::new(config.max_attempts),
            config,
            connector,
            bonds,
            state: LinkState::Disconnected,
            connection: None,
            last_epoch: 0,
            events: Vec::new(),
            audit: VecDeque::with_capacity(AUDIT_CAPACITY),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn address(&self) -> Option<&DeviceAddress> {
        self.connection.as_ref().map(|c| &c.address)
    }

    pub fn is_bonded(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.bonded)
    }

    pub fn is_link_up(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.link_up)
    }

    /// Epoch of the open transport; callbacks stamped otherwise are stale
    pub fn epoch(&self) -> Option<u64> {
        self.connection.as_ref().and_then(|c| c.epoch)
    }

    pub fn mtu(&self) -> Option<u16> {
        self.connection.as_ref().and_then(|c| c.mtu)
    }

    /// Target service, once discovery has located it
    pub fn service(&self) -> Option<Uuid> {
        self.connection.as_ref().and_then(|c| c.service)
    }

    pub fn rx(&self) -> Option<&GattCharacteristic> {
        self.connection.as_ref().and_then(|c| c.rx.as_ref())
    }

    pub fn tx(&self) -> Option<&GattCharacteristic> {
        self.connection.as_ref().and_then(|c| c.tx.as_ref())
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut CommandQueue {
        &mut self.queue
    }

    /// Recent transitions, oldest first
    pub fn transitions(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit.iter()
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        self.collect_queue_signals();
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------------
    // Application API
    // ------------------------------------------------------------------------

    /// Begin connecting to `address`
    pub fn connect(&mut self, address: DeviceAddress) -> Result<()> {
        if self.state != LinkState::Disconnected {
            return Err(LinkError::InvalidState { state: self.state });
        }

        let bonded = self.bonds.is_bonded(&address);
        info!("Connecting to {} (bonded: {})", address, bonded);
        self.connection = Some(Connection::new(address.clone(), bonded));
        self.transition(LinkState::Connecting, "connect requested");

        if self.config.remove_bond_on_connect && self.bonds.remove_bond(&address) {
            info!("Bond removal requested for {}, waiting for bond state", address);
            if let Some(conn) = self.connection.as_mut() {
                conn.bonded = false;
            }
            return Ok(());
        }

        if let Err(e) = self.open_transport() {
            self.connection = None;
            self.transition(LinkState::Disconnected, "transport open failed");
            return Err(e);
        }
        Ok(())
    }

    /// Tear the link down, discarding all pending commands
    pub fn disconnect(&mut self) -> Result<()> {
        match self.state {
            LinkState::Disconnected | LinkState::Disconnecting => {
                debug!("Disconnect requested while {}", self.state);
                return Ok(());
            }
            _ => {}
        }

        self.queue.clear();
        let has_transport = self
            .connection
            .as_ref()
            .is_some_and(|c| c.transport.is_some());

        if has_transport {
            self.transition(LinkState::Disconnecting, "disconnect requested");
            if self.issue(Command::disconnect()).is_err() {
                self.teardown("disconnect without transport");
            }
        } else {
            self.teardown("disconnect requested");
        }
        Ok(())
    }

    /// Release the transport immediately without waiting for a callback
    pub fn close(&mut self) {
        if self.connection.is_some() {
            self.teardown("closed locally");
        }
    }

    /// Queue `payload` for the TX characteristic
    ///
    /// Payloads longer than the negotiated MTU allows are split into
    /// consecutive writes. Returns the number of writes queued.
    pub fn send(&mut self, payload: &[u8]) -> Result<usize> {
        if !self.state.can_send() {
            return Err(LinkError::NotReady { state: self.state });
        }
        if payload.is_empty() {
            return Err(LinkError::EmptyPayload);
        }
        let Some((tx, mtu)) = self
            .connection
            .as_ref()
            .and_then(|c| c.tx.as_ref().map(|tx| (tx.clone(), c.mtu)))
        else {
            return Err(LinkError::NotReady { state: self.state });
        };

        let chunk_len = usize::from(mtu.unwrap_or(MIN_ATT_MTU))
            .saturating_sub(ATT_HEADER_LEN)
            .max(1);
        let write_type = tx.properties.preferred_write_type();
        let mut queued = 0;
        for chunk in payload.chunks(chunk_len) {
            let command = Command::write_characteristic(tx.reference(), chunk, write_type);
            if let Err(e) = self.queue.enqueue(command) {
                self.on_transport_lost();
                return Err(e);
            }
            queued += 1;
        }
        debug!(
            "Queued {} bytes as {} write(s): {}",
            payload.len(),
            queued,
            hex::encode_upper(payload)
        );
        self.queue.run_next();
        Ok(queued)
    }

    /// Queue a read of `characteristic` in the target service
    ///
    /// The value arrives later as [`LinkEvent::ValueRead`].
    pub fn read(&mut self, characteristic: Uuid) -> Result<()> {
        if !self.state.can_send() {
            return Err(LinkError::NotReady { state: self.state });
        }
        let Some(target) = self.connection.as_ref().and_then(|c| {
            c.characteristics
                .iter()
                .find(|candidate| candidate.uuid == characteristic)
        }) else {
            return Err(LinkError::UnknownCharacteristic {
                uuid: characteristic,
            });
        };
        if !target.properties.is_readable() {
            return Err(LinkError::NotReadable {
                uuid: characteristic,
            });
        }
        let command = Command::read_characteristic(target.reference());
        self.issue(command)
    }

    // ------------------------------------------------------------------------
    // Event Handlers (called by the dispatcher)
    // ------------------------------------------------------------------------

    pub(crate) fn on_link_connected(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            debug!("Connected event without a connection, ignoring");
            return;
        };
        conn.link_up = true;
        if !conn.bonded {
            info!("Link to {} up, waiting for bonding", conn.address);
            return;
        }
        self.advance_to_connected("link connected");
    }

    pub(crate) fn on_link_disconnected(&mut self) {
        if self.connection.is_none() {
            debug!("Disconnected event without a connection, ignoring");
            return;
        }
        info!("Disconnected from GATT server");
        self.teardown("link disconnected");
    }

    pub(crate) fn on_bonded(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            debug!("Bonded event without a connection, ignoring");
            return;
        };
        info!("Device {} bonded", conn.address);
        conn.bonded = true;

        if conn.transport.is_none() {
            if let Err(e) = self.open_transport() {
                self.fail_open(e);
            }
        } else if conn.link_up {
            self.advance_to_connected("bonding confirmed");
        }
    }

    pub(crate) fn on_bond_lost(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            debug!("Bond-none event without a connection, ignoring");
            return;
        };
        info!("Bond with {} is gone, reconnecting", conn.address);
        conn.bonded = false;
        self.release_transport();
        self.transition(LinkState::Connecting, "bond lost");
        if let Err(e) = self.open_transport() {
            self.fail_open(e);
        }
    }

    pub(crate) fn on_services_discovered(&mut self, services: &[GattService]) {
        if self.state != LinkState::Connected {
            warn!("Services discovered while {}, ignoring", self.state);
            return;
        }
        self.transition(LinkState::ServicesDiscovered, "services discovered");

        let service_uuid = self.config.service_uuid;
        let Some(service) = find_service(services, service_uuid) else {
            error!("Service {} not found among {} service(s)", service_uuid, services.len());
            self.stall(LinkError::ServiceNotFound { uuid: service_uuid });
            return;
        };
        info!("Service {} found", service_uuid);

        let roles = resolve_roles(&service.characteristics, self.config.role_policy);
        for (role, characteristic) in [("RX", &roles.rx), ("TX", &roles.tx)] {
            if let Some(c) = characteristic {
                info!("{} found: {} [{}]", role, c.uuid, c.properties);
            }
        }

        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        conn.service = Some(service_uuid);
        conn.characteristics = service.characteristics.clone();
        conn.rx = roles.rx.clone();
        conn.tx = roles.tx.clone();

        let (Some(rx), Some(tx)) = (roles.rx, roles.tx) else {
            let role = if conn.rx.is_none() { "RX" } else { "TX" };
            self.stall(LinkError::CharacteristicNotFound {
                role,
                service: service_uuid,
            });
            return;
        };
        let Some(transport) = conn.transport.clone() else {
            return;
        };

        let mut writes = Vec::new();
        let rx_value = if rx.properties.is_notifiable() {
            ENABLE_NOTIFICATION_VALUE
        } else {
            ENABLE_INDICATION_VALUE
        };
        writes.extend(subscription_write(transport.as_ref(), &rx, rx_value, "RX"));

        if tx.uuid == rx.uuid {
            debug!("TX shares the RX characteristic, one subscription covers both");
        } else if tx.properties.is_indicatable() {
            writes.extend(subscription_write(
                transport.as_ref(),
                &tx,
                ENABLE_INDICATION_VALUE,
                "TX",
            ));
        } else {
            debug!("TX is not indicatable, skipping its subscription");
        }

        conn.pending_subscriptions = writes.len();
        if writes.is_empty() {
            self.request_mtu();
            return;
        }
        for write in writes {
            if self.issue(write).is_err() {
                return;
            }
        }
    }

    pub(crate) fn on_descriptor_written(&mut self, descriptor: &DescriptorRef) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        debug!("Descriptor {} written", descriptor);
        if conn.pending_subscriptions == 0 {
            debug!("Descriptor write outside subscription setup");
            return;
        }
        conn.pending_subscriptions -= 1;
        if conn.pending_subscriptions == 0 {
            self.request_mtu();
        }
    }

    pub(crate) fn on_mtu_changed(&mut self, mtu: u16) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        info!("Negotiated MTU {}", mtu);
        conn.mtu = Some(mtu);
        match self.state {
            LinkState::ServicesDiscovered => {
                self.transition(LinkState::Ready, "mtu negotiated");
                self.events.push(LinkEvent::Ready { mtu });
            }
            LinkState::Ready => {}
            other => warn!("MTU changed while {}", other),
        }
    }

    pub(crate) fn on_payload(&mut self, characteristic: CharacteristicRef, value: Vec<u8>) {
        if self.connection.is_none() {
            debug!("Notification without a connection, dropping");
            return;
        }
        debug!(
            "Received {} byte(s) from {}: {}",
            value.len(),
            characteristic.uuid,
            hex::encode_upper(&value)
        );
        self.events.push(LinkEvent::PayloadReceived {
            characteristic: characteristic.uuid,
            value,
        });
    }

    pub(crate) fn on_characteristic_read(
        &mut self,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    ) {
        debug!(
            "Read {} byte(s) from {}: {}",
            value.len(),
            characteristic.uuid,
            hex::encode_upper(&value)
        );
        self.events.push(LinkEvent::ValueRead {
            characteristic: characteristic.uuid,
            value,
        });
    }

    pub(crate) fn on_transport_lost(&mut self) {
        warn!("Transport lost, forcing disconnect");
        self.events.push(LinkEvent::TransportGone);
        self.teardown("transport gone");
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Convert queue signals into link events
    fn collect_queue_signals(&mut self) {
        for abandoned in self.queue.take_abandoned() {
            let action = abandoned.kind();
            self.events.push(LinkEvent::RetryExhausted {
                action,
                attempts: abandoned.attempt(),
            });
            if action == CommandKind::Disconnect {
                self.teardown("disconnect abandoned");
            }
        }
        if self.queue.take_transport_lost() {
            self.on_transport_lost();
        }
    }

    fn advance_to_connected(&mut self, trigger: &'static str) {
        if self.state != LinkState::Connecting {
            debug!("Already past Connecting ({}), not advancing", self.state);
            return;
        }
        self.transition(LinkState::Connected, trigger);
        info!("Attempting to start service discovery");
        let _ = self.issue(Command::discover_services());
    }

    fn request_mtu(&mut self) {
        let _ = self.issue(Command::request_mtu(self.config.mtu));
    }

    /// Enqueue and kick the queue
    fn issue(&mut self, command: Command) -> Result<()> {
        match self.queue.enqueue(command) {
            Ok(()) => {
                self.queue.run_next();
                Ok(())
            }
            Err(e) => {
                self.on_transport_lost();
                Err(e)
            }
        }
    }

    fn open_transport(&mut self) -> Result<()> {
        let Some(conn) = self.connection.as_mut() else {
            return Err(LinkError::InvalidState { state: self.state });
        };
        self.last_epoch += 1;
        let epoch = self.last_epoch;
        let transport = self.connector.open(&conn.address, epoch)?;
        debug!("Opened transport to {} (epoch {})", conn.address, epoch);
        self.queue.attach(&transport);
        conn.transport = Some(transport);
        conn.epoch = Some(epoch);
        conn.link_up = false;
        self.issue(Command::connect())
    }

    fn fail_open(&mut self, error: LinkError) {
        error!("Could not open transport: {}", error);
        self.events.push(LinkEvent::SetupStalled { error });
        self.teardown("transport open failed");
    }

    fn release_transport(&mut self) {
        self.queue.detach();
        if let Some(conn) = self.connection.as_mut() {
            if let Some(transport) = conn.transport.take() {
                transport.close();
            }
            conn.epoch = None;
            conn.link_up = false;
            conn.clear_roles();
        }
    }

    fn teardown(&mut self, trigger: &'static str) {
        self.release_transport();
        self.connection = None;
        self.transition(LinkState::Disconnected, trigger);
    }

    fn stall(&mut self, error: LinkError) {
        warn!("Setup stalled in {}: {}", self.state, error);
        self.events.push(LinkEvent::SetupStalled { error });
    }

    fn transition(&mut self, to: LinkState, trigger: &'static str) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("Link state {} -> {} ({})", from, to, trigger);
        self.state = to;
        if self.audit.len() == AUDIT_CAPACITY {
            self.audit.pop_front();
        }
        self.audit.push_back(AuditEntry { from, to, trigger });
        self.events.push(LinkEvent::StateChanged { from, to });
    }
}

impl fmt::Debug for ConnectionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("state", &self.state)
            .field("address", &self.address())
            .field("bonded", &self.is_bonded())
            .field("epoch", &self.epoch())
            .field("queue", &self.queue)
            .finish()
    }
}

/// Phase (a) of a subscription; returns the phase (b) CCCD write on success
fn subscription_write(
    transport: &dyn GattTransport,
    characteristic: &GattCharacteristic,
    value: [u8; 2],
    role: &str,
) -> Option<Command> {
    if let Err(rejected) = transport.set_notification(&characteristic.reference(), true) {
        error!("Couldn't set notifications for {} characteristic: {}", role, rejected.reason);
        return None;
    }
    let Some(descriptor) = characteristic.client_config() else {
        error!("Couldn't get {} client descriptor", role);
        return None;
    };
    Some(Command::write_descriptor(descriptor, value))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct NoConnector;

    impl GattConnector for NoConnector {
        fn open(&self, address: &DeviceAddress, _: u64) -> Result<Arc<dyn GattTransport>> {
            Err(LinkError::TransportOpenFailed(address.to_string()))
        }
    }

    struct NoBonds;

    impl BondController for NoBonds {
        fn is_bonded(&self, _: &DeviceAddress) -> bool {
            false
        }
        fn remove_bond(&self, _: &DeviceAddress) -> bool {
            false
        }
    }

    fn lifecycle(config: LinkConfig) -> Result<ConnectionLifecycle> {
        ConnectionLifecycle::new(config, Arc::new(NoConnector), Arc::new(NoBonds))
    }

    #[test]
    fn test_state_names() {
        assert_eq!(LinkState::ServicesDiscovered.to_string(), "ServicesDiscovered");
        assert!(LinkState::Ready.can_send());
        assert!(!LinkState::Connected.can_send());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = lifecycle(LinkConfig::default().with_mtu(600));
        assert!(matches!(result, Err(LinkError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_failed_open_returns_to_disconnected() {
        let mut lifecycle = lifecycle(LinkConfig::default()).unwrap();
        let address = DeviceAddress::new("11:22:33:44:55:66").unwrap();

        assert!(lifecycle.connect(address).is_err());
        assert_eq!(lifecycle.state(), LinkState::Disconnected);
        assert!(lifecycle.address().is_none());

        let events = lifecycle.drain_events();
        assert_eq!(
            events,
            vec![
                LinkEvent::StateChanged {
                    from: LinkState::Disconnected,
                    to: LinkState::Connecting,
                },
                LinkEvent::StateChanged {
                    from: LinkState::Connecting,
                    to: LinkState::Disconnected,
                },
            ]
        );
    }

    #[test]
    fn test_audit_is_bounded() {
        let mut lifecycle = lifecycle(LinkConfig::default()).unwrap();
        for _ in 0..AUDIT_CAPACITY {
            let _ = lifecycle.connect(DeviceAddress::new("11:22:33:44:55:66").unwrap());
        }
        assert_eq!(lifecycle.transitions().count(), AUDIT_CAPACITY);
    }

    #[test]
    fn test_send_requires_ready() {
        let mut lifecycle = lifecycle(LinkConfig::default()).unwrap();
        assert_eq!(
            lifecycle.send(&[1]),
            Err(LinkError::NotReady {
                state: LinkState::Disconnected
            })
        );
        assert_eq!(
            lifecycle.read(Uuid::from_u128(7)),
            Err(LinkError::NotReady {
                state: LinkState::Disconnected
            })
        );
    }

    #[test]
    fn test_failed_open_consumes_epoch() {
        let mut lifecycle = lifecycle(LinkConfig::default()).unwrap();
        let address = DeviceAddress::new("11:22:33:44:55:66").unwrap();
        let _ = lifecycle.connect(address.clone());
        let _ = lifecycle.connect(address);
        assert_eq!(lifecycle.last_epoch, 2);
        assert_eq!(lifecycle.epoch(), None);
    }
}
