//! Single-flight GATT command queue with bounded retry
//!
//! BLE controllers accept one GATT procedure at a time. The queue keeps
//! commands in FIFO order and dispatches the head only when nothing is in
//! flight; the head stays at the front until its completion is reported
//! through [`CommandQueue::on_success`] or [`CommandQueue::on_failure`].

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use tracing::{debug, error, warn};

use crate::command::{Command, CommandKind};
use crate::error::LinkError;
use crate::transport::GattTransport;

/// Default number of dispatches before a command is abandoned
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ----------------------------------------------------------------------------
// Command Queue
// ----------------------------------------------------------------------------

/// Ordered, single-flight executor of [`Command`]s
pub struct CommandQueue {
    /// Commands in execution order; the head is in flight while `busy`
    pending: VecDeque<Command>,
    busy: bool,
    /// Head is being re-executed after a failure
    retrying: bool,
    max_attempts: u32,
    /// Handle for the current connection epoch, owned by the lifecycle
    transport: Option<Weak<dyn GattTransport>>,
    /// Stamp of the most recent dispatch; never reset, so stamps stay unique
    /// across transports
    dispatch_seq: u64,
    abandoned: Vec<Command>,
    transport_lost: bool,
}

impl CommandQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            busy: false,
            retrying: false,
            max_attempts: max_attempts.max(1),
            transport: None,
            dispatch_seq: 0,
            abandoned: Vec::new(),
            transport_lost: false,
        }
    }

    /// Bind the queue to the transport of a new connection epoch
    pub fn attach(&mut self, transport: &Arc<dyn GattTransport>) {
        self.clear();
        self.transport = Some(Arc::downgrade(transport));
    }

    /// Forget the transport and all outstanding work
    pub fn detach(&mut self) {
        self.clear();
        self.transport = None;
    }

    /// Discard every pending command, including the one in flight
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} queued command(s)", self.pending.len());
        }
        self.pending.clear();
        self.busy = false;
        self.retrying = false;
    }

    fn transport(&self) -> Option<Arc<dyn GattTransport>> {
        self.transport.as_ref().and_then(Weak::upgrade)
    }

    /// Append a command
    ///
    /// Fails only when the transport handle is absent, in which case the
    /// whole queue is cleared.
    pub fn enqueue(&mut self, command: Command) -> Result<(), LinkError> {
        if self.transport().is_none() {
            warn!("Transport gone, dropping {} and clearing queue", command);
            self.clear();
            return Err(LinkError::TransportGone);
        }
        debug!("Enqueued {} (queue length {})", command, self.pending.len() + 1);
        self.pending.push_back(command);
        Ok(())
    }

    /// Dispatch the head command unless one is already in flight
    pub fn run_next(&mut self) {
        loop {
            if self.busy || self.pending.is_empty() {
                return;
            }

            let Some(transport) = self.transport() else {
                error!(
                    "Transport gone with {} command(s) pending, clearing queue",
                    self.pending.len()
                );
                self.clear();
                self.transport_lost = true;
                return;
            };

            let retrying = self.retrying;
            let Some(head) = self.pending.front_mut() else {
                return;
            };
            if !retrying {
                head.reset_attempts();
            }
            head.record_attempt();
            self.busy = true;
            self.dispatch_seq += 1;
            debug!(
                "Dispatching {} (attempt {}, seq {})",
                head,
                head.attempt(),
                self.dispatch_seq
            );

            match head.execute(transport.as_ref(), self.dispatch_seq) {
                Ok(()) => return,
                Err(rejected) => {
                    warn!("{} rejected synchronously: {}", head, rejected.reason);
                    self.fail_head();
                }
            }
        }
    }

    /// The in-flight command completed successfully
    pub fn on_success(&mut self) {
        if !self.busy {
            warn!("Success reported with no command in flight");
            return;
        }
        if let Some(done) = self.pending.pop_front() {
            debug!("Completed {} after {} attempt(s)", done, done.attempt());
        }
        self.busy = false;
        self.retrying = false;
        self.run_next();
    }

    /// The in-flight command failed; retry it or abandon it at the ceiling
    pub fn on_failure(&mut self) {
        if !self.busy {
            warn!("Failure reported with no command in flight");
            return;
        }
        self.fail_head();
        self.run_next();
    }

    fn fail_head(&mut self) {
        self.busy = false;
        let exhausted = match self.pending.front() {
            Some(head) => head.attempt() >= self.max_attempts,
            None => return,
        };
        if exhausted {
            if let Some(abandoned) = self.pending.pop_front() {
                error!(
                    "Max number of tries reached, abandoning {} after {} attempt(s)",
                    abandoned,
                    abandoned.attempt()
                );
                self.abandoned.push(abandoned);
            }
            self.retrying = false;
        } else {
            debug!("Retrying in-flight command");
            self.retrying = true;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Commands queued, including the one in flight
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_transport(&self) -> bool {
        self.transport().is_some()
    }

    pub fn in_flight(&self) -> Option<&Command> {
        if self.busy {
            self.pending.front()
        } else {
            None
        }
    }

    pub fn in_flight_kind(&self) -> Option<CommandKind> {
        self.in_flight().map(Command::kind)
    }

    /// Dispatch stamp of the in-flight command
    ///
    /// The transport echoes this on the completion callback; a completion
    /// carrying any other stamp answers an earlier dispatch.
    pub fn in_flight_seq(&self) -> Option<u64> {
        self.busy.then_some(self.dispatch_seq)
    }

    /// Commands abandoned at the retry ceiling since the last call
    pub fn take_abandoned(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.abandoned)
    }

    /// Whether the queue found its transport gone since the last call
    pub fn take_transport_lost(&mut self) -> bool {
        std::mem::take(&mut self.transport_lost)
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("pending", &self.pending.len())
            .field("busy", &self.busy)
            .field("retrying", &self.retrying)
            .field("max_attempts", &self.max_attempts)
            .field("dispatch_seq", &self.dispatch_seq)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportRejected;
    use crate::gatt::{CharacteristicRef, DescriptorRef, WriteType};
    use crate::transport::DispatchResult;
    use std::sync::Mutex;

    /// Records dispatched command kinds and stamps; optionally rejects everything
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<CommandKind>>,
        seqs: Mutex<Vec<u64>>,
        reject: bool,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<CommandKind> {
            self.calls.lock().unwrap().clone()
        }

        fn seqs(&self) -> Vec<u64> {
            self.seqs.lock().unwrap().clone()
        }

        fn record(&self, kind: CommandKind, seq: u64) -> DispatchResult {
            self.calls.lock().unwrap().push(kind);
            self.seqs.lock().unwrap().push(seq);
            if self.reject {
                Err(TransportRejected::new("busy"))
            } else {
                Ok(())
            }
        }
    }

    impl GattTransport for RecordingTransport {
        fn connect(&self, seq: u64) -> DispatchResult {
            self.record(CommandKind::Connect, seq)
        }
        fn discover_services(&self, seq: u64) -> DispatchResult {
            self.record(CommandKind::DiscoverServices, seq)
        }
        fn set_notification(&self, _: &CharacteristicRef, _: bool) -> DispatchResult {
            Ok(())
        }
        fn write_descriptor(&self, seq: u64, _: &DescriptorRef, _: &[u8]) -> DispatchResult {
            self.record(CommandKind::WriteDescriptor, seq)
        }
        fn write_characteristic(
            &self,
            seq: u64,
            _: &CharacteristicRef,
            _: &[u8],
            _: WriteType,
        ) -> DispatchResult {
            self.record(CommandKind::WriteCharacteristic, seq)
        }
        fn read_characteristic(&self, seq: u64, _: &CharacteristicRef) -> DispatchResult {
            self.record(CommandKind::ReadCharacteristic, seq)
        }
        fn request_mtu(&self, seq: u64, _: u16) -> DispatchResult {
            self.record(CommandKind::RequestMtu, seq)
        }
        fn disconnect(&self, seq: u64) -> DispatchResult {
            self.record(CommandKind::Disconnect, seq)
        }
        fn close(&self) {}
    }

    fn attached_queue(transport: &Arc<RecordingTransport>) -> CommandQueue {
        let mut queue = CommandQueue::new(DEFAULT_MAX_ATTEMPTS);
        let handle: Arc<dyn GattTransport> = transport.clone();
        queue.attach(&handle);
        queue
    }

    #[test]
    fn test_enqueue_without_transport_fails() {
        let mut queue = CommandQueue::new(DEFAULT_MAX_ATTEMPTS);
        assert_eq!(
            queue.enqueue(Command::discover_services()),
            Err(LinkError::TransportGone)
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_single_flight() {
        let transport = Arc::new(RecordingTransport::default());
        let mut queue = attached_queue(&transport);

        queue.enqueue(Command::discover_services()).unwrap();
        queue.enqueue(Command::request_mtu(517)).unwrap();
        queue.run_next();
        queue.run_next();

        assert!(queue.is_busy());
        assert_eq!(transport.calls(), vec![CommandKind::DiscoverServices]);
        assert_eq!(queue.in_flight_kind(), Some(CommandKind::DiscoverServices));

        queue.on_success();
        assert_eq!(
            transport.calls(),
            vec![CommandKind::DiscoverServices, CommandKind::RequestMtu]
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retry_keeps_position() {
        let transport = Arc::new(RecordingTransport::default());
        let mut queue = attached_queue(&transport);

        queue.enqueue(Command::discover_services()).unwrap();
        queue.enqueue(Command::request_mtu(517)).unwrap();
        queue.run_next();
        queue.on_failure();

        assert_eq!(queue.in_flight_kind(), Some(CommandKind::DiscoverServices));
        assert_eq!(queue.in_flight().map(Command::attempt), Some(2));
        assert_eq!(
            transport.calls(),
            vec![CommandKind::DiscoverServices, CommandKind::DiscoverServices]
        );
    }

    #[test]
    fn test_abandon_at_ceiling() {
        let transport = Arc::new(RecordingTransport::default());
        let mut queue = attached_queue(&transport);

        queue.enqueue(Command::discover_services()).unwrap();
        queue.enqueue(Command::request_mtu(517)).unwrap();
        queue.run_next();
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            queue.on_failure();
        }

        let abandoned = queue.take_abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].kind(), CommandKind::DiscoverServices);
        assert_eq!(abandoned[0].attempt(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(queue.in_flight_kind(), Some(CommandKind::RequestMtu));
        assert_eq!(queue.in_flight().map(Command::attempt), Some(1));
    }

    #[test]
    fn test_synchronous_rejection_is_bounded() {
        let transport = Arc::new(RecordingTransport {
            reject: true,
            ..Default::default()
        });
        let mut queue = attached_queue(&transport);

        queue.enqueue(Command::discover_services()).unwrap();
        queue.enqueue(Command::disconnect()).unwrap();
        queue.run_next();

        assert!(!queue.is_busy());
        assert!(queue.is_empty());
        assert_eq!(queue.take_abandoned().len(), 2);
        assert_eq!(transport.calls().len(), 2 * DEFAULT_MAX_ATTEMPTS as usize);
    }

    #[test]
    fn test_transport_drop_clears_pending() {
        let transport = Arc::new(RecordingTransport::default());
        let mut queue = attached_queue(&transport);

        queue.enqueue(Command::discover_services()).unwrap();
        queue.enqueue(Command::request_mtu(517)).unwrap();
        queue.run_next();
        drop(transport);

        queue.on_success();
        assert!(queue.is_empty());
        assert!(!queue.is_busy());
        assert!(queue.take_transport_lost());
        assert!(!queue.take_transport_lost());
    }

    #[test]
    fn test_completion_without_in_flight_is_ignored() {
        let transport = Arc::new(RecordingTransport::default());
        let mut queue = attached_queue(&transport);

        queue.enqueue(Command::discover_services()).unwrap();
        queue.on_success();
        queue.on_failure();

        assert_eq!(queue.len(), 1);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_in_flight_seq_changes_per_dispatch() {
        let transport = Arc::new(RecordingTransport::default());
        let mut queue = attached_queue(&transport);
        assert_eq!(queue.in_flight_seq(), None);

        queue.enqueue(Command::connect()).unwrap();
        queue.run_next();
        let first = queue.in_flight_seq().unwrap();
        queue.on_failure();
        let second = queue.in_flight_seq().unwrap();
        assert!(second > first);
        assert_eq!(transport.seqs(), vec![first, second]);
    }

    #[test]
    fn test_seq_survives_reattach() {
        let transport = Arc::new(RecordingTransport::default());
        let mut queue = attached_queue(&transport);
        queue.enqueue(Command::connect()).unwrap();
        queue.run_next();
        let before = queue.in_flight_seq().unwrap();

        let replacement: Arc<dyn GattTransport> = Arc::new(RecordingTransport::default());
        queue.attach(&replacement);
        assert_eq!(queue.in_flight_seq(), None);
        queue.enqueue(Command::connect()).unwrap();
        queue.run_next();
        assert!(queue.in_flight_seq().unwrap() > before);
    }
}
