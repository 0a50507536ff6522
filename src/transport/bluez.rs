//! BlueZ backend using bluer

use crate::transport::traits::{
    Availability, BlePlatform, CharacteristicProperties, CharacteristicRef, GattCharacteristic,
    GattService, HardwareEvent, HardwareEventReceiver, HardwareEventSender,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, ErrorKind};
use bytes::Bytes;
use futures::{pin_mut, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signal strength reported when BlueZ has none cached
const RSSI_UNKNOWN: i16 = -127;

/// Reported when the discovery stream ends on its own
const SCAN_STREAM_ENDED: i32 = -1;

/// Poll interval while waiting for BlueZ to resolve services
const SERVICES_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Tasks {
    scan: Option<JoinHandle<()>>,
    /// Link watcher and notification forwarders per device
    links: HashMap<String, Vec<JoinHandle<()>>>,
}

/// BLE platform backed by the system BlueZ daemon
pub struct BluerPlatform {
    _session: bluer::Session,
    adapter: Adapter,
    events: HardwareEventSender,
    tasks: Mutex<Tasks>,
}

impl BluerPlatform {
    /// Open the default adapter
    pub async fn new() -> Result<(Arc<Self>, HardwareEventReceiver)> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("[BLE] Using adapter {}", adapter.name());

        let (events, rx) = mpsc::unbounded_channel();
        let platform = Arc::new(Self {
            _session: session,
            adapter,
            events,
            tasks: Mutex::new(Tasks::default()),
        });
        Ok((platform, rx))
    }

    fn device(&self, address: &str) -> Result<Device> {
        let address: Address = address
            .parse()
            .map_err(|_| anyhow!("invalid Bluetooth address {}", address))?;
        Ok(self.adapter.device(address)?)
    }

    fn track(&self, address: &str, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks
                .links
                .entry(address.to_string())
                .or_default()
                .push(handle);
        }
    }

    fn abort_link_tasks(&self, address: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.links.remove(address).unwrap_or_default() {
                handle.abort();
            }
        }
    }

    async fn find_characteristic(
        &self,
        address: &str,
        target: &CharacteristicRef,
    ) -> Result<Characteristic> {
        let device = self.device(address)?;
        for service in device.services().await? {
            if service.uuid().await? != target.service {
                continue;
            }
            for characteristic in service.characteristics().await? {
                if characteristic.uuid().await? == target.characteristic {
                    return Ok(characteristic);
                }
            }
        }
        Err(anyhow!(
            "characteristic {} not found on {}",
            target.characteristic,
            address
        ))
    }
}

/// Bring the link up, report it, then watch for it going down
async fn watch_link(device: Device, events: HardwareEventSender) {
    let address = device.address().to_string();

    if let Err(e) = device.connect().await {
        let _ = events.send(HardwareEvent::Disconnected {
            address,
            reason: e.to_string(),
        });
        return;
    }

    // Service discovery is only meaningful once BlueZ has resolved them
    loop {
        match device.is_services_resolved().await {
            Ok(true) => break,
            Ok(false) => tokio::time::sleep(SERVICES_POLL).await,
            Err(e) => {
                let _ = events.send(HardwareEvent::Disconnected {
                    address,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }

    let device_events = match device.events().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(HardwareEvent::Disconnected {
                address,
                reason: e.to_string(),
            });
            return;
        }
    };

    let _ = events.send(HardwareEvent::Connected {
        address: address.clone(),
    });

    pin_mut!(device_events);
    while let Some(event) = device_events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            let _ = events.send(HardwareEvent::Disconnected {
                address,
                reason: "link lost".into(),
            });
            return;
        }
    }
}

#[async_trait]
impl BlePlatform for BluerPlatform {
    async fn availability(&self) -> Availability {
        match self.adapter.is_powered().await {
            Ok(true) => Availability::Ready,
            Ok(false) => Availability::AdapterDisabled,
            Err(e) if matches!(e.kind, ErrorKind::NotAuthorized) => Availability::PermissionDenied,
            Err(e) => {
                debug!("[BLE] Adapter query failed: {}", e);
                Availability::AdapterMissing
            }
        }
    }

    async fn start_scan(&self) -> Result<()> {
        let discover = self.adapter.discover_devices().await?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            pin_mut!(discover);
            while let Some(event) = discover.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let Ok(device) = adapter.device(address) else {
                    continue;
                };
                let name = device.name().await.ok().flatten();
                let rssi = device.rssi().await.ok().flatten().unwrap_or(RSSI_UNKNOWN);
                let _ = events.send(HardwareEvent::Advertisement {
                    name,
                    address: address.to_string(),
                    rssi,
                });
            }
            let _ = events.send(HardwareEvent::ScanFailed {
                code: SCAN_STREAM_ENDED,
            });
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(previous) = tasks.scan.replace(handle) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        // Dropping the discovery stream ends the scan
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(scan) = tasks.scan.take() {
                scan.abort();
            }
        }
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let device = self.device(address)?;
        self.abort_link_tasks(address);

        let handle = tokio::spawn(watch_link(device, self.events.clone()));
        self.track(address, handle);
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        self.abort_link_tasks(address);
        let device = self.device(address)?;
        if device.is_connected().await? {
            device.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<GattService>> {
        let device = self.device(address)?;
        let mut services = Vec::new();

        for service in device.services().await? {
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await? {
                let flags = characteristic.flags().await?;
                characteristics.push(GattCharacteristic {
                    uuid: characteristic.uuid().await?,
                    properties: CharacteristicProperties {
                        write: flags.write,
                        write_without_response: flags.write_without_response,
                        notify: flags.notify,
                        indicate: flags.indicate,
                    },
                });
            }
            services.push(GattService {
                uuid: service.uuid().await?,
                characteristics,
            });
        }

        debug!("[BLE] {} exposes {} service(s)", address, services.len());
        Ok(services)
    }

    async fn subscribe(&self, address: &str, characteristic: &CharacteristicRef) -> Result<()> {
        let remote = self.find_characteristic(address, characteristic).await?;
        let notifications = remote.notify().await?;
        let events = self.events.clone();
        let characteristic = *characteristic;

        let handle = tokio::spawn(async move {
            pin_mut!(notifications);
            while let Some(value) = notifications.next().await {
                let _ = events.send(HardwareEvent::Notification {
                    characteristic,
                    value,
                });
            }
            warn!("[BLE] Notification stream ended");
        });
        self.track(address, handle);
        Ok(())
    }

    async fn write(
        &self,
        address: &str,
        characteristic: &CharacteristicRef,
        data: Bytes,
    ) -> Result<()> {
        let remote = self.find_characteristic(address, characteristic).await?;
        remote.write(&data).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BlueZ"
    }
}
