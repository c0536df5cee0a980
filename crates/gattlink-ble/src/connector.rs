//! Opens btleplug transports for the link engine

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use btleplug::api::{Central, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use gattlink_core::{DeviceAddress, GattConnector, GattEventSender, GattTransport, LinkError};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::BleConfig;
use crate::convert::properties_address;
use crate::error::{BleError, Result};
use crate::scanner::{DeviceScanner, DiscoveredDevice};
use crate::transport::{BtleplugTransport, EventSink};

/// Connector over one btleplug adapter
///
/// [`GattConnector::open`] is synchronous, so peripherals must be located
/// beforehand with [`BtleplugConnector::locate`] or [`BtleplugConnector::remember`].
pub struct BtleplugConnector {
    adapter: Adapter,
    events: GattEventSender,
    runtime: Handle,
    config: BleConfig,
    known: Mutex<HashMap<DeviceAddress, Peripheral>>,
}

impl BtleplugConnector {
    /// Must be called from within a Tokio runtime
    pub fn new(adapter: Adapter, events: GattEventSender, config: BleConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| BleError::NoRuntime)?;
        Ok(Self {
            adapter,
            events,
            runtime,
            config,
            known: Mutex::new(HashMap::new()),
        })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    /// Make a scanned device available to [`GattConnector::open`]
    pub fn remember(&self, device: &DiscoveredDevice) {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.result.address.clone(), device.peripheral.clone());
    }

    pub fn is_known(&self, address: &DeviceAddress) -> bool {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(address)
    }

    /// Find `address` among cached peripherals, scanning if needed
    pub async fn locate(&self, address: &DeviceAddress) -> Result<()> {
        if self.is_known(address) {
            return Ok(());
        }

        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if properties_address(&properties).as_ref() == Some(address) {
                debug!("Found {} among cached peripherals", address);
                self.insert(address.clone(), peripheral);
                return Ok(());
            }
        }

        info!("Scanning for {}", address);
        let scanner = DeviceScanner::new(self.adapter.clone(), self.config.scan_service);
        match scanner.find(address, self.config.scan_duration).await? {
            Some(device) => {
                self.remember(&device);
                Ok(())
            }
            None => Err(BleError::DeviceNotFound {
                address: address.clone(),
            }),
        }
    }

    fn insert(&self, address: DeviceAddress, peripheral: Peripheral) {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, peripheral);
    }
}

impl GattConnector for BtleplugConnector {
    fn open(
        &self,
        address: &DeviceAddress,
        epoch: u64,
    ) -> std::result::Result<Arc<dyn GattTransport>, LinkError> {
        let peripheral = self
            .known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
            .ok_or_else(|| BleError::DeviceNotFound {
                address: address.clone(),
            })?;

        debug!("Opening transport to {} (epoch {})", address, epoch);
        Ok(Arc::new(BtleplugTransport::new(
            self.adapter.clone(),
            peripheral,
            EventSink::new(self.events.clone(), epoch),
            self.runtime.clone(),
            &self.config,
        )))
    }
}
