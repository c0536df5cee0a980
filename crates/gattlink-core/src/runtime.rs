//! Tokio task that owns a link
//!
//! Application requests, platform callbacks and command deadlines all funnel
//! into one task, so the lifecycle and its queue are only ever touched from a
//! single execution context.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::dispatcher::GattEventDispatcher;
use crate::error::{LinkError, Result};
use crate::events::{GattCallback, LinkEvent};
use crate::gatt::DeviceAddress;
use crate::lifecycle::{ConnectionLifecycle, LinkState};
use crate::transport::{BondController, GattConnector};

/// Capacity of the request channel
const REQUEST_CHANNEL_CAPACITY: usize = 32;

pub type GattEventSender = mpsc::UnboundedSender<GattCallback>;
pub type GattEventReceiver = mpsc::UnboundedReceiver<GattCallback>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Channel on which a platform layer reports [`GattCallback`]s
pub fn gatt_event_channel() -> (GattEventSender, GattEventReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Requests and Handle
// ----------------------------------------------------------------------------

enum LinkRequest {
    Connect {
        address: DeviceAddress,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Read {
        characteristic: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<LinkState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end of a running [`LinkRuntime`]
#[derive(Clone, Debug)]
pub struct LinkHandle {
    requests: mpsc::Sender<LinkRequest>,
}

impl std::fmt::Debug for LinkRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRequest::Connect { address, .. } => write!(f, "Connect({})", address),
            LinkRequest::Disconnect { .. } => f.write_str("Disconnect"),
            LinkRequest::Send { payload, .. } => write!(f, "Send({} bytes)", payload.len()),
            LinkRequest::Read { characteristic, .. } => write!(f, "Read({})", characteristic),
            LinkRequest::State { .. } => f.write_str("State"),
            LinkRequest::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl LinkHandle {
    pub async fn connect(&self, address: DeviceAddress) -> Result<()> {
        self.request(|reply| LinkRequest::Connect { address, reply })
            .await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| LinkRequest::Disconnect { reply }).await?
    }

    /// Queue a payload; resolves to the number of writes it was split into
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<usize> {
        let payload = payload.into();
        self.request(|reply| LinkRequest::Send { payload, reply })
            .await?
    }

    /// Queue a read; the value arrives as [`LinkEvent::ValueRead`]
    pub async fn read(&self, characteristic: Uuid) -> Result<()> {
        self.request(|reply| LinkRequest::Read {
            characteristic,
            reply,
        })
        .await?
    }

    pub async fn state(&self) -> Result<LinkState> {
        self.request(|reply| LinkRequest::State { reply }).await
    }

    /// Stop the task, releasing any open transport
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| LinkRequest::Shutdown { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> LinkRequest,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| LinkError::RuntimeStopped)?;
        response.await.map_err(|_| LinkError::RuntimeStopped)
    }
}

// ----------------------------------------------------------------------------
// Link Runtime
// ----------------------------------------------------------------------------

/// Event loop serializing everything that touches one link
pub struct LinkRuntime {
    dispatcher: GattEventDispatcher,
    requests: mpsc::Receiver<LinkRequest>,
    gatt_events: GattEventReceiver,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    command_timeout: Option<Duration>,
    /// Sequence and expiry of the in-flight command
    deadline: Option<(u64, Instant)>,
    gatt_events_open: bool,
    running: bool,
}

impl LinkRuntime {
    /// Build a runtime without starting it
    pub fn new(
        config: LinkConfig,
        connector: Arc<dyn GattConnector>,
        bonds: Arc<dyn BondController>,
        gatt_events: GattEventReceiver,
    ) -> Result<(Self, LinkHandle, LinkEventReceiver)> {
        let command_timeout = config.command_timeout();
        let lifecycle = ConnectionLifecycle::new(config, connector, bonds)?;
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let runtime = Self {
            dispatcher: GattEventDispatcher::new(lifecycle),
            requests: request_rx,
            gatt_events,
            link_events: link_tx,
            command_timeout,
            deadline: None,
            gatt_events_open: true,
            running: true,
        };
        let handle = LinkHandle {
            requests: request_tx,
        };
        Ok((runtime, handle, link_rx))
    }

    /// Build a runtime and spawn it on the current Tokio runtime
    pub fn spawn(
        config: LinkConfig,
        connector: Arc<dyn GattConnector>,
        bonds: Arc<dyn BondController>,
        gatt_events: GattEventReceiver,
    ) -> Result<(LinkHandle, LinkEventReceiver)> {
        let (runtime, handle, events) = Self::new(config, connector, bonds, gatt_events)?;
        tokio::spawn(runtime.run());
        Ok((handle, events))
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        info!("Link task starting");

        while self.running {
            let deadline = self.deadline;
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        info!("All link handles dropped, shutting down");
                        self.close();
                    }
                },

                callback = self.gatt_events.recv(), if self.gatt_events_open => match callback {
                    Some(callback) => {
                        let events = self.dispatcher.dispatch(callback);
                        self.publish(events);
                    }
                    None => {
                        warn!("GATT event channel closed");
                        self.gatt_events_open = false;
                    }
                },

                _ = sleep_until(deadline.map_or_else(Instant::now, |(_, at)| at)),
                    if deadline.is_some() =>
                {
                    if let Some((seq, _)) = deadline {
                        self.deadline = None;
                        let events = self.dispatcher.command_timed_out(seq);
                        self.publish(events);
                    }
                }
            }

            self.refresh_deadline();
        }

        info!("Link task stopped");
    }

    fn handle_request(&mut self, request: LinkRequest) {
        debug!("Link request {:?}", request);
        let lifecycle = self.dispatcher.lifecycle_mut();
        match request {
            LinkRequest::Connect { address, reply } => {
                let _ = reply.send(lifecycle.connect(address));
            }
            LinkRequest::Disconnect { reply } => {
                let _ = reply.send(lifecycle.disconnect());
            }
            LinkRequest::Send { payload, reply } => {
                let _ = reply.send(lifecycle.send(&payload));
            }
            LinkRequest::Read {
                characteristic,
                reply,
            } => {
                let _ = reply.send(lifecycle.read(characteristic));
            }
            LinkRequest::State { reply } => {
                let _ = reply.send(lifecycle.state());
            }
            LinkRequest::Shutdown { reply } => {
                self.close();
                let _ = reply.send(());
                return;
            }
        }
        let events = self.dispatcher.lifecycle_mut().drain_events();
        self.publish(events);
    }

    fn close(&mut self) {
        self.dispatcher.lifecycle_mut().close();
        let events = self.dispatcher.lifecycle_mut().drain_events();
        self.publish(events);
        self.running = false;
    }

    /// Arm a deadline for a newly dispatched command
    fn refresh_deadline(&mut self) {
        let Some(timeout) = self.command_timeout else {
            return;
        };
        match self.dispatcher.lifecycle().queue().in_flight_seq() {
            Some(seq) if self.deadline.map(|(armed, _)| armed) == Some(seq) => {}
            Some(seq) => self.deadline = Some((seq, Instant::now() + timeout)),
            None => self.deadline = None,
        }
    }

    fn publish(&self, events: Vec<LinkEvent>) {
        for event in events {
            debug!("Link event: {}", event);
            if self.link_events.send(event).is_err() {
                debug!("No listener for link events");
            }
        }
    }
}
