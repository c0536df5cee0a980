//! btleplug-backed GATT transport
//!
//! Every accepted operation runs as its own task on the captured runtime and
//! reports its completion as a [`GattCallback`] echoing the dispatch stamp.
//! Each transport stamps everything it emits with the epoch it was opened
//! with, so a late event from a replaced transport is recognisable as stale.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use gattlink_core::{
    CharProperties, CharacteristicRef, ConnectionStatus, DescriptorRef, DispatchResult,
    GattCallback, GattEvent, GattEventSender, GattStatus, GattTransport, TransportRejected,
    WriteType, DISABLE_NOTIFICATION_VALUE,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BleConfig;
use crate::convert::{to_btleplug_write_type, to_gatt_service};

// ----------------------------------------------------------------------------
// Shared Task State
// ----------------------------------------------------------------------------

/// Event sink shared with spawned operations; silent once the transport closes
#[derive(Clone)]
pub(crate) struct EventSink {
    events: GattEventSender,
    epoch: u64,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn new(events: GattEventSender, epoch: u64) -> Self {
        Self {
            events,
            epoch,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Report the outcome of the dispatch stamped `seq`
    fn complete(&self, seq: u64, event: GattEvent) {
        self.emit(GattCallback::completion(self.epoch, seq, event));
    }

    /// Report an event no dispatch asked for
    fn notify(&self, event: GattEvent) {
        self.emit(GattCallback::unsolicited(self.epoch, event));
    }

    fn emit(&self, callback: GattCallback) {
        if self.is_closed() {
            debug!(
                "Transport (epoch {}) closed, dropping {}",
                self.epoch,
                callback.event.name()
            );
            return;
        }
        if self.events.send(callback).is_err() {
            warn!("GATT event channel closed");
        }
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// One connection epoch to one peripheral
pub struct BtleplugTransport {
    peripheral: Peripheral,
    sink: EventSink,
    runtime: Handle,
    config: BleConfig,
    /// Characteristics with the local notification flag set
    notifying: Mutex<HashSet<(Uuid, Uuid)>>,
    forwarding: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugTransport {
    pub(crate) fn new(
        adapter: Adapter,
        peripheral: Peripheral,
        sink: EventSink,
        runtime: Handle,
        config: &BleConfig,
    ) -> Self {
        let transport = Self {
            peripheral,
            sink,
            runtime,
            config: config.clone(),
            notifying: Mutex::new(HashSet::new()),
            forwarding: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        };
        transport.watch_disconnects(adapter);
        transport
    }

    /// Report adapter-level disconnection of this peripheral
    fn watch_disconnects(&self, adapter: Adapter) {
        let id = self.peripheral.id();
        let sink = self.sink.clone();
        let task = self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get BLE events: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        info!("Peripheral disconnected");
                        sink.notify(GattEvent::ConnectionStateChanged {
                            status: GattStatus::SUCCESS,
                            state: ConnectionStatus::Disconnected,
                        });
                    }
                }
                if sink.is_closed() {
                    break;
                }
            }
        });
        self.track(task);
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Run `operation` in the background and report the event it resolves
    /// to as the completion of dispatch `seq`
    fn spawn_op<F>(&self, seq: u64, operation: F) -> DispatchResult
    where
        F: Future<Output = GattEvent> + Send + 'static,
    {
        if self.sink.is_closed() {
            return Err(TransportRejected::new("transport closed"));
        }
        let sink = self.sink.clone();
        let task = self.runtime.spawn(async move {
            let event = operation.await;
            sink.complete(seq, event);
        });
        self.track(task);
        Ok(())
    }

    fn find_characteristic(&self, service: Uuid, uuid: Uuid) -> Option<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
    }

    fn require_characteristic(
        &self,
        service: Uuid,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportRejected> {
        self.find_characteristic(service, uuid)
            .ok_or_else(|| TransportRejected::new(format!("unknown characteristic {}", uuid)))
    }

    /// Forward notifications for the rest of this connection epoch
    fn start_forwarding(&self) {
        if self.forwarding.swap(true, Ordering::SeqCst) {
            return;
        }
        let peripheral = self.peripheral.clone();
        let sink = self.sink.clone();
        let forwarding = self.forwarding.clone();
        let task = self.runtime.spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    forwarding.store(false, Ordering::SeqCst);
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                if sink.is_closed() {
                    break;
                }
                let service = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid)
                    .unwrap_or_else(Uuid::nil);
                sink.notify(GattEvent::CharacteristicChanged {
                    characteristic: CharacteristicRef {
                        service,
                        uuid: notification.uuid,
                    },
                    value: notification.value,
                });
            }
            debug!("Notification stream ended");
            forwarding.store(false, Ordering::SeqCst);
        });
        self.track(task);
    }
}

impl GattTransport for BtleplugTransport {
    fn connect(&self, seq: u64) -> DispatchResult {
        let peripheral = self.peripheral.clone();
        let connect_timeout = self.config.connect_timeout;
        self.spawn_op(seq, async move {
            let status = match timeout(connect_timeout, peripheral.connect()).await {
                Ok(Ok(())) => {
                    info!("Connected to peripheral");
                    return GattEvent::ConnectionStateChanged {
                        status: GattStatus::SUCCESS,
                        state: ConnectionStatus::Connected,
                    };
                }
                Ok(Err(e)) => {
                    warn!("Connection failed: {}", e);
                    GattStatus::FAILURE
                }
                Err(_) => {
                    warn!("Connection timed out after {:?}", connect_timeout);
                    GattStatus::FAILURE
                }
            };
            GattEvent::ConnectionStateChanged {
                status,
                state: ConnectionStatus::Disconnected,
            }
        })?;
        self.start_forwarding();
        Ok(())
    }

    fn discover_services(&self, seq: u64) -> DispatchResult {
        let peripheral = self.peripheral.clone();
        self.spawn_op(seq, async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services: Vec<_> = peripheral
                        .services()
                        .iter()
                        .map(to_gatt_service)
                        .collect();
                    debug!("Discovered {} service(s)", services.len());
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::SUCCESS,
                        services,
                    }
                }
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::FAILURE,
                        services: Vec::new(),
                    }
                }
            }
        })
    }

    fn set_notification(
        &self,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> DispatchResult {
        if self.sink.is_closed() {
            return Err(TransportRejected::new("transport closed"));
        }
        let found = self.require_characteristic(characteristic.service, characteristic.uuid)?;
        let key = (characteristic.service, characteristic.uuid);
        let mut notifying = self.notifying.lock().unwrap_or_else(|e| e.into_inner());
        if enabled {
            let flags = CharProperties::from_bits_retain(found.properties.bits());
            if !flags.can_push() {
                return Err(TransportRejected::new(format!(
                    "{} cannot notify or indicate",
                    characteristic
                )));
            }
            notifying.insert(key);
        } else {
            notifying.remove(&key);
        }
        Ok(())
    }

    fn write_descriptor(
        &self,
        seq: u64,
        descriptor: &DescriptorRef,
        value: &[u8],
    ) -> DispatchResult {
        let characteristic =
            self.require_characteristic(descriptor.service, descriptor.characteristic)?;
        let peripheral = self.peripheral.clone();
        let descriptor_ref = *descriptor;

        if descriptor.is_client_config() {
            let enable = value != DISABLE_NOTIFICATION_VALUE;
            let flagged = self
                .notifying
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&(descriptor.service, descriptor.characteristic));
            if enable && !flagged {
                return Err(TransportRejected::new(
                    "notification flag not set for characteristic",
                ));
            }
            return self.spawn_op(seq, async move {
                let result = if enable {
                    peripheral.subscribe(&characteristic).await
                } else {
                    peripheral.unsubscribe(&characteristic).await
                };
                let status = match result {
                    Ok(()) => GattStatus::SUCCESS,
                    Err(e) => {
                        warn!("Subscription change on {} failed: {}", characteristic.uuid, e);
                        GattStatus::FAILURE
                    }
                };
                GattEvent::DescriptorWritten {
                    status,
                    descriptor: descriptor_ref,
                }
            });
        }

        let Some(target) = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor.uuid)
            .cloned()
        else {
            return Err(TransportRejected::new(format!(
                "unknown descriptor {}",
                descriptor.uuid
            )));
        };
        let value = value.to_vec();
        self.spawn_op(seq, async move {
            let status = match peripheral.write_descriptor(&target, &value).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("Descriptor write failed: {}", e);
                    GattStatus::WRITE_NOT_PERMITTED
                }
            };
            GattEvent::DescriptorWritten {
                status,
                descriptor: descriptor_ref,
            }
        })
    }

    fn write_characteristic(
        &self,
        seq: u64,
        characteristic: &CharacteristicRef,
        payload: &[u8],
        write_type: WriteType,
    ) -> DispatchResult {
        let target = self.require_characteristic(characteristic.service, characteristic.uuid)?;
        let peripheral = self.peripheral.clone();
        let characteristic = *characteristic;
        let payload = payload.to_vec();
        self.spawn_op(seq, async move {
            let status = match peripheral
                .write(&target, &payload, to_btleplug_write_type(write_type))
                .await
            {
                Ok(()) => {
                    debug!("Wrote {} to {}", hex::encode_upper(&payload), characteristic.uuid);
                    GattStatus::SUCCESS
                }
                Err(e) => {
                    warn!("Write to {} failed: {}", characteristic.uuid, e);
                    GattStatus::FAILURE
                }
            };
            GattEvent::CharacteristicWritten {
                status,
                characteristic,
            }
        })
    }

    fn read_characteristic(&self, seq: u64, characteristic: &CharacteristicRef) -> DispatchResult {
        let target = self.require_characteristic(characteristic.service, characteristic.uuid)?;
        let peripheral = self.peripheral.clone();
        let characteristic = *characteristic;
        self.spawn_op(seq, async move {
            match peripheral.read(&target).await {
                Ok(value) => {
                    debug!("Read {} from {}", hex::encode_upper(&value), characteristic.uuid);
                    GattEvent::CharacteristicRead {
                        status: GattStatus::SUCCESS,
                        characteristic,
                        value,
                    }
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", characteristic.uuid, e);
                    GattEvent::CharacteristicRead {
                        status: GattStatus::READ_NOT_PERMITTED,
                        characteristic,
                        value: Vec::new(),
                    }
                }
            }
        })
    }

    fn request_mtu(&self, seq: u64, mtu: u16) -> DispatchResult {
        // The OS stack negotiates during connection and btleplug does not
        // expose the result
        let reported = self.config.reported_mtu(mtu);
        debug!("MTU {} requested, reporting {}", mtu, reported);
        self.spawn_op(seq, async move {
            GattEvent::MtuChanged {
                status: GattStatus::SUCCESS,
                mtu: reported,
            }
        })
    }

    fn disconnect(&self, seq: u64) -> DispatchResult {
        let peripheral = self.peripheral.clone();
        self.spawn_op(seq, async move {
            match peripheral.disconnect().await {
                Ok(()) => GattEvent::ConnectionStateChanged {
                    status: GattStatus::SUCCESS,
                    state: ConnectionStatus::Disconnected,
                },
                Err(e) => {
                    warn!("Disconnect failed: {}", e);
                    GattEvent::ConnectionStateChanged {
                        status: GattStatus::FAILURE,
                        state: ConnectionStatus::Connected,
                    }
                }
            }
        })
    }

    fn close(&self) {
        if !self.sink.close() {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }

        let peripheral = self.peripheral.clone();
        self.runtime.spawn(async move {
            if let Ok(true) = peripheral.is_connected().await {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Failed to disconnect on close: {}", e);
                }
            }
        });
        debug!("Transport (epoch {}) closed", self.sink.epoch);
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.close();
    }
}
