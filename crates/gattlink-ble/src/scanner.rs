//! BLE device scanning with per-session address deduplication

use std::collections::HashSet;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use gattlink_core::DeviceAddress;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::convert::properties_address;
use crate::error::Result;

// ----------------------------------------------------------------------------
// Scan Results
// ----------------------------------------------------------------------------

/// One advertising device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

impl ScanResult {
    pub fn advertises(&self, service: Uuid) -> bool {
        self.services.contains(&service)
    }
}

/// A scan result plus the platform handle needed to connect to it
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub result: ScanResult,
    pub peripheral: Peripheral,
}

/// Reports each address once per scan session
#[derive(Debug, Default)]
pub struct ScanDeduplicator {
    seen: HashSet<DeviceAddress>,
}

impl ScanDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time `address` is observed
    pub fn observe(&mut self, address: &DeviceAddress) -> bool {
        self.seen.insert(address.clone())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Scanner
// ----------------------------------------------------------------------------

/// Scans an adapter for advertising devices
pub struct DeviceScanner {
    adapter: Adapter,
    service: Option<Uuid>,
}

impl DeviceScanner {
    pub fn new(adapter: Adapter, service: Option<Uuid>) -> Self {
        Self { adapter, service }
    }

    /// Scan for `duration`, returning each device once in discovery order
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        let mut found = Vec::new();
        self.run(duration, |device| {
            info!(
                "Discovered {} {:?} (rssi {:?})",
                device.result.address, device.result.name, device.result.rssi
            );
            found.push(device);
            false
        })
        .await?;
        Ok(found)
    }

    /// Scan until `address` shows up or `duration` elapses
    pub async fn find(
        &self,
        address: &DeviceAddress,
        duration: Duration,
    ) -> Result<Option<DiscoveredDevice>> {
        let mut target = None;
        self.run(duration, |device| {
            if device.result.address == *address {
                target = Some(device);
                return true;
            }
            false
        })
        .await?;
        Ok(target)
    }

    /// Drive one scan session; `on_device` returns true to stop early
    async fn run(
        &self,
        duration: Duration,
        mut on_device: impl FnMut(DiscoveredDevice) -> bool,
    ) -> Result<()> {
        let mut events = self.adapter.events().await?;
        let filter = ScanFilter {
            services: self.service.into_iter().collect(),
        };
        self.adapter.start_scan(filter).await?;
        info!("Scanning for {:?}", duration);

        let deadline = Instant::now() + duration;
        let mut dedup = ScanDeduplicator::new();

        while let Ok(Some(event)) = timeout_at(deadline, events.next()).await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let Some(device) = self.describe(&id).await else {
                continue;
            };
            if let Some(service) = self.service {
                if !device.result.services.is_empty() && !device.result.advertises(service) {
                    continue;
                }
            }
            if !dedup.observe(&device.result.address) {
                continue;
            }
            if on_device(device) {
                break;
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }
        debug!("Scan finished with {} unique device(s)", dedup.len());
        Ok(())
    }

    async fn describe(
        &self,
        id: &btleplug::platform::PeripheralId,
    ) -> Option<DiscoveredDevice> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        let address = properties_address(&properties)?;
        Some(DiscoveredDevice {
            result: ScanResult {
                address,
                name: properties.local_name,
                rssi: properties.rssi,
                services: properties.services,
            },
            peripheral,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_by_address() {
        let mut dedup = ScanDeduplicator::new();
        let a = DeviceAddress::new("AA:BB:CC:DD:EE:01").unwrap();
        let a_lower = DeviceAddress::new("aa:bb:cc:dd:ee:01").unwrap();
        let b = DeviceAddress::new("AA:BB:CC:DD:EE:02").unwrap();

        assert!(dedup.is_empty());
        assert!(dedup.observe(&a));
        assert!(!dedup.observe(&a_lower));
        assert!(dedup.observe(&b));
        assert!(!dedup.observe(&b));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_advertises() {
        let service = Uuid::from_u128(0xED310001_C889_5D66_AE38_A7A01230635A);
        let result = ScanResult {
            address: DeviceAddress::new("AA:BB:CC:DD:EE:01").unwrap(),
            name: Some("Sensor".to_string()),
            rssi: Some(-60),
            services: vec![service],
        };
        assert!(result.advertises(service));
        assert!(!result.advertises(Uuid::from_u128(0x180D)));
    }
}
