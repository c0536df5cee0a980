//! Single entry point for platform GATT callbacks
//!
//! Every asynchronous callback is turned into exactly one queue signal
//! (success, failure or none) plus any lifecycle transition it implies.
//! Callbacks are matched by identity, never by kind alone: a transport event
//! must carry the epoch of the open transport, and a completion must echo the
//! dispatch stamp of the in-flight command.

use tracing::{debug, warn};

use crate::command::CommandKind;
use crate::events::{BondState, ConnectionStatus, GattCallback, GattEvent, LinkEvent};
use crate::gatt::GattStatus;
use crate::lifecycle::ConnectionLifecycle;

/// Routes [`GattCallback`]s into a [`ConnectionLifecycle`]
#[derive(Debug)]
pub struct GattEventDispatcher {
    lifecycle: ConnectionLifecycle,
}

impl GattEventDispatcher {
    pub fn new(lifecycle: ConnectionLifecycle) -> Self {
        Self { lifecycle }
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut ConnectionLifecycle {
        &mut self.lifecycle
    }

    pub fn into_inner(self) -> ConnectionLifecycle {
        self.lifecycle
    }

    /// Handle one callback and return the link events it produced
    pub fn dispatch(&mut self, callback: GattCallback) -> Vec<LinkEvent> {
        let GattCallback { epoch, seq, event } = callback;
        debug!(
            "Dispatching {} (epoch {:?}, seq {:?}) in state {}",
            event.name(),
            epoch,
            seq,
            self.lifecycle.state()
        );

        let current = self.lifecycle.epoch();
        if event.is_transport_event() && (epoch.is_none() || epoch != current) {
            debug!(
                "{} from epoch {:?} ignored, current epoch is {:?}",
                event.name(),
                epoch,
                current
            );
            return self.lifecycle.drain_events();
        }

        match event {
            GattEvent::ConnectionStateChanged { status, state } => {
                self.on_connection_state(seq, status, state)
            }
            GattEvent::ServicesDiscovered { status, services } => {
                if self.complete(seq, status, CommandKind::DiscoverServices) {
                    self.lifecycle.on_services_discovered(&services);
                }
            }
            GattEvent::DescriptorWritten { status, descriptor } => {
                if self.complete(seq, status, CommandKind::WriteDescriptor) {
                    self.lifecycle.on_descriptor_written(&descriptor);
                }
            }
            GattEvent::CharacteristicWritten {
                status,
                characteristic,
            } => {
                if self.complete(seq, status, CommandKind::WriteCharacteristic) {
                    debug!("Write to {} acknowledged", characteristic);
                }
            }
            GattEvent::CharacteristicRead {
                status,
                characteristic,
                value,
            } => {
                if self.complete(seq, status, CommandKind::ReadCharacteristic) {
                    self.lifecycle.on_characteristic_read(characteristic, value);
                }
            }
            GattEvent::MtuChanged { status, mtu } => {
                if self.complete(seq, status, CommandKind::RequestMtu) {
                    self.lifecycle.on_mtu_changed(mtu);
                }
            }
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.lifecycle.on_payload(characteristic, value),
            GattEvent::BondStateChanged(BondState::Bonded) => self.lifecycle.on_bonded(),
            GattEvent::BondStateChanged(BondState::None) => self.lifecycle.on_bond_lost(),
            GattEvent::BondStateChanged(BondState::Bonding) => debug!("Bonding in progress"),
        }

        self.lifecycle.drain_events()
    }

    /// The in-flight command stamped `seq` outlived its deadline
    pub fn command_timed_out(&mut self, seq: u64) -> Vec<LinkEvent> {
        let queue = self.lifecycle.queue_mut();
        if queue.in_flight_seq() == Some(seq) {
            warn!(
                "{} timed out, treating as failure",
                queue
                    .in_flight_kind()
                    .map_or("command", |kind| kind.name())
            );
            queue.on_failure();
        } else {
            debug!("Stale timeout for seq {}", seq);
        }
        self.lifecycle.drain_events()
    }

    /// A connection-state change is either the completion of an in-flight
    /// Connect or Disconnect (carrying its `seq`) or an unsolicited link
    /// change reported by the current transport
    fn on_connection_state(
        &mut self,
        seq: Option<u64>,
        status: GattStatus,
        state: ConnectionStatus,
    ) {
        let queue = self.lifecycle.queue_mut();
        let answers_in_flight = seq.is_some() && seq == queue.in_flight_seq();
        if seq.is_some() && !answers_in_flight {
            debug!("Stale connection-state completion (seq {:?}) ignored", seq);
            return;
        }

        if !status.is_success() {
            warn!("Connection state change to {:?} failed: {}", state, status);
            if answers_in_flight {
                queue.on_failure();
            } else if state == ConnectionStatus::Disconnected {
                self.lifecycle.on_link_disconnected();
            }
            return;
        }

        match state {
            ConnectionStatus::Connected => {
                if answers_in_flight && queue.in_flight_kind() == Some(CommandKind::Connect) {
                    queue.on_success();
                }
                self.lifecycle.on_link_connected();
            }
            ConnectionStatus::Disconnected => self.lifecycle.on_link_disconnected(),
            ConnectionStatus::Connecting | ConnectionStatus::Disconnecting => {
                debug!("Link {:?}", state)
            }
        }
    }

    /// Apply a completion for `kind`; true when the lifecycle may advance
    ///
    /// Completions whose stamp or kind does not match the in-flight command
    /// answer an earlier dispatch and are ignored.
    ///
    /// Commands other than Connect are only enqueued while bonded, and losing
    /// the bond replaces the transport, so every completion reaching the bond
    /// check below belongs to a bonded epoch. The check stays as the retry
    /// rule for an unbonded completion should a platform ever report one.
    fn complete(&mut self, seq: Option<u64>, status: GattStatus, kind: CommandKind) -> bool {
        let bonded = self.lifecycle.is_bonded();
        let queue = self.lifecycle.queue_mut();

        if seq.is_none() || seq != queue.in_flight_seq() {
            debug!("Stale {} completion (seq {:?}) ignored", kind, seq);
            return false;
        }
        if queue.in_flight_kind() != Some(kind) {
            warn!(
                "{} completion stamped for in-flight {:?}, ignoring",
                kind,
                queue.in_flight_kind()
            );
            return false;
        }
        if !status.is_success() {
            warn!("{} failed: {}", kind, status);
            queue.on_failure();
            return false;
        }
        if !bonded {
            warn!("{} completed before bonding confirmed, retrying", kind);
            queue.on_failure();
            return false;
        }
        queue.on_success();
        true
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::error::LinkError;
    use crate::gatt::{CharacteristicRef, DescriptorRef, DeviceAddress, WriteType};
    use crate::lifecycle::LinkState;
    use crate::transport::{BondController, DispatchResult, GattConnector, GattTransport};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct NullTransport {
        calls: Mutex<Vec<&'static str>>,
    }

    impl NullTransport {
        fn push(&self, call: &'static str) -> DispatchResult {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl GattTransport for NullTransport {
        fn connect(&self, _: u64) -> DispatchResult {
            self.push("connect")
        }
        fn discover_services(&self, _: u64) -> DispatchResult {
            self.push("discover")
        }
        fn set_notification(&self, _: &CharacteristicRef, _: bool) -> DispatchResult {
            Ok(())
        }
        fn write_descriptor(&self, _: u64, _: &DescriptorRef, _: &[u8]) -> DispatchResult {
            self.push("descriptor")
        }
        fn write_characteristic(
            &self,
            _: u64,
            _: &CharacteristicRef,
            _: &[u8],
            _: WriteType,
        ) -> DispatchResult {
            self.push("write")
        }
        fn read_characteristic(&self, _: u64, _: &CharacteristicRef) -> DispatchResult {
            self.push("read")
        }
        fn request_mtu(&self, _: u64, _: u16) -> DispatchResult {
            self.push("mtu")
        }
        fn disconnect(&self, _: u64) -> DispatchResult {
            self.push("disconnect")
        }
        fn close(&self) {}
    }

    struct Connector(Arc<NullTransport>);

    impl GattConnector for Connector {
        fn open(&self, _: &DeviceAddress, _: u64) -> Result<Arc<dyn GattTransport>, LinkError> {
            Ok(self.0.clone())
        }
    }

    struct Bonds(bool);

    impl BondController for Bonds {
        fn is_bonded(&self, _: &DeviceAddress) -> bool {
            self.0
        }
        fn remove_bond(&self, _: &DeviceAddress) -> bool {
            false
        }
    }

    fn dispatcher(bonded: bool) -> (GattEventDispatcher, Arc<NullTransport>) {
        let transport = Arc::new(NullTransport::default());
        let lifecycle = ConnectionLifecycle::new(
            LinkConfig::default(),
            Arc::new(Connector(transport.clone())),
            Arc::new(Bonds(bonded)),
        )
        .unwrap();
        let mut dispatcher = GattEventDispatcher::new(lifecycle);
        dispatcher
            .lifecycle_mut()
            .connect(DeviceAddress::new("AA:BB:CC:DD:EE:FF").unwrap())
            .unwrap();
        (dispatcher, transport)
    }

    /// Stamp `event` as the completion of whatever is in flight
    fn answer(dispatcher: &mut GattEventDispatcher, event: GattEvent) -> Vec<LinkEvent> {
        let lifecycle = dispatcher.lifecycle();
        let callback = GattCallback {
            epoch: lifecycle.epoch(),
            seq: lifecycle.queue().in_flight_seq(),
            event,
        };
        dispatcher.dispatch(callback)
    }

    fn connected() -> GattEvent {
        GattEvent::ConnectionStateChanged {
            status: GattStatus::SUCCESS,
            state: ConnectionStatus::Connected,
        }
    }

    #[test]
    fn test_connected_advances_when_bonded() {
        let (mut dispatcher, transport) = dispatcher(true);

        let events = answer(&mut dispatcher, connected());
        assert_eq!(dispatcher.lifecycle().state(), LinkState::Connected);
        assert!(events.contains(&LinkEvent::StateChanged {
            from: LinkState::Connecting,
            to: LinkState::Connected,
        }));
        assert_eq!(*transport.calls.lock().unwrap(), vec!["connect", "discover"]);
    }

    #[test]
    fn test_wrong_kind_completion_is_ignored() {
        let (mut dispatcher, transport) = dispatcher(true);
        answer(&mut dispatcher, connected());

        let events = answer(
            &mut dispatcher,
            GattEvent::MtuChanged {
                status: GattStatus::SUCCESS,
                mtu: 185,
            },
        );
        assert!(events.is_empty());
        assert_eq!(
            dispatcher.lifecycle().queue().in_flight_kind(),
            Some(CommandKind::DiscoverServices)
        );
        assert_eq!(transport.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unstamped_completion_is_ignored() {
        let (mut dispatcher, transport) = dispatcher(true);
        answer(&mut dispatcher, connected());
        let epoch = dispatcher.lifecycle().epoch().unwrap();

        dispatcher.dispatch(GattCallback::unsolicited(
            epoch,
            GattEvent::ServicesDiscovered {
                status: GattStatus::FAILURE,
                services: Vec::new(),
            },
        ));
        assert_eq!(transport.calls.lock().unwrap().len(), 2);
        assert_eq!(
            dispatcher.lifecycle().queue().in_flight().map(|c| c.attempt()),
            Some(1)
        );
    }

    #[test]
    fn test_failed_discovery_is_retried() {
        let (mut dispatcher, transport) = dispatcher(true);
        answer(&mut dispatcher, connected());
        answer(
            &mut dispatcher,
            GattEvent::ServicesDiscovered {
                status: GattStatus::FAILURE,
                services: Vec::new(),
            },
        );

        assert_eq!(
            *transport.calls.lock().unwrap(),
            vec!["connect", "discover", "discover"]
        );
        assert_eq!(dispatcher.lifecycle().state(), LinkState::Connected);
    }

    #[test]
    fn test_timeout_matches_sequence() {
        let (mut dispatcher, transport) = dispatcher(true);
        let seq = dispatcher.lifecycle().queue().in_flight_seq().unwrap();

        dispatcher.command_timed_out(seq + 10);
        assert_eq!(transport.calls.lock().unwrap().len(), 1);

        dispatcher.command_timed_out(seq);
        assert_eq!(*transport.calls.lock().unwrap(), vec!["connect", "connect"]);
        assert_ne!(dispatcher.lifecycle().queue().in_flight_seq(), Some(seq));
    }

    #[test]
    fn test_other_epoch_is_ignored() {
        let (mut dispatcher, _) = dispatcher(true);
        let epoch = dispatcher.lifecycle().epoch().unwrap();
        let seq = dispatcher.lifecycle().queue().in_flight_seq().unwrap();

        let events = dispatcher.dispatch(GattCallback::completion(epoch + 1, seq, connected()));
        assert!(events.is_empty());
        assert_eq!(dispatcher.lifecycle().state(), LinkState::Connecting);
        assert!(!dispatcher.lifecycle().is_link_up());
    }

    #[test]
    fn test_bonding_event_is_informational() {
        let (mut dispatcher, _) = dispatcher(false);
        let events = dispatcher.dispatch(GattCallback::platform(GattEvent::BondStateChanged(
            BondState::Bonding,
        )));
        assert!(events.is_empty());
        assert_eq!(dispatcher.lifecycle().state(), LinkState::Connecting);
    }
}
