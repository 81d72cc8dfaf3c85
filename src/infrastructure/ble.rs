//! BLE Link Transport
//!
//! Implements [`LinkTransport`] over btleplug: filtered scan for the device,
//! GATT connect, subscribe to the telemetry characteristic for inbound frame
//! bytes, write commands to the command characteristic.

use crate::domain::prefs::Prefs;
use crate::transport::{LinkError, LinkEvent, LinkHandle, LinkTransport};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BleConfig {
    pub service_uuid: Uuid,
    pub telemetry_char_uuid: Uuid,
    pub command_char_uuid: Uuid,
    /// Advertised device name, accepted as an alternative to the service
    /// UUID — some firmware revisions omit the UUID from advertisements.
    pub device_name: String,
    pub scan_timeout: Duration,
}

impl BleConfig {
    pub fn from_prefs(prefs: &Prefs) -> anyhow::Result<Self> {
        Ok(Self {
            service_uuid: Uuid::parse_str(&prefs.ble_service_uuid)?,
            telemetry_char_uuid: Uuid::parse_str(&prefs.ble_telemetry_char_uuid)?,
            command_char_uuid: Uuid::parse_str(&prefs.ble_command_char_uuid)?,
            device_name: prefs.ble_device_name.clone(),
            scan_timeout: prefs.scan_timeout(),
        })
    }
}

pub struct BleTransport {
    config: BleConfig,
    adapter: Option<Adapter>,
}

impl BleTransport {
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            adapter: None,
        }
    }

    /// Initialise the BLE manager and adapter if not already done.
    async fn ensure_adapter(&mut self) -> Result<Adapter, LinkError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::Adapter(format!("BLE manager init failed: {e}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| LinkError::Adapter(format!("failed to list BLE adapters: {e}")))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Adapter("no BLE adapter found".into()))?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn find_device(&self, adapter: &Adapter) -> Result<Peripheral, LinkError> {
        let filter = ScanFilter {
            services: vec![self.config.service_uuid],
        };
        adapter
            .start_scan(filter)
            .await
            .map_err(|e| LinkError::Adapter(format!("failed to start BLE scan: {e}")))?;
        debug!(
            "BLE scan started for service {} / name {:?}",
            self.config.service_uuid, self.config.device_name
        );

        let result =
            tokio::time::timeout(self.config.scan_timeout, self.wait_for_device(adapter)).await;
        let _ = adapter.stop_scan().await;
        match result {
            Ok(found) => found,
            Err(_) => {
                debug!("scan timeout, no matching device");
                Err(LinkError::NotFound)
            }
        }
    }

    async fn wait_for_device(&self, adapter: &Adapter) -> Result<Peripheral, LinkError> {
        let mut events = adapter
            .events()
            .await
            .map_err(|e| LinkError::Adapter(e.to_string()))?;
        while let Some(event) = events.next().await {
            let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
            else {
                continue;
            };
            let Ok(peripheral) = adapter.peripheral(&id).await else {
                continue;
            };
            if self.matches(&peripheral).await {
                return Ok(peripheral);
            }
        }
        Err(LinkError::NotFound)
    }

    async fn matches(&self, peripheral: &Peripheral) -> bool {
        let Ok(Some(properties)) = peripheral.properties().await else {
            return false;
        };
        if properties.services.contains(&self.config.service_uuid) {
            return true;
        }
        properties.local_name.as_deref() == Some(self.config.device_name.as_str())
    }
}

#[async_trait]
impl LinkTransport for BleTransport {
    async fn connect(&mut self) -> Result<Box<dyn LinkHandle>, LinkError> {
        let adapter = self.ensure_adapter().await?;
        let peripheral = self.find_device(&adapter).await?;
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name)
            .unwrap_or_else(|| "Unknown".to_string());
        info!("connecting to {name}");

        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::Refused(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| LinkError::Refused(e.to_string()))?;

        let telemetry_char = find_characteristic(&peripheral, self.config.telemetry_char_uuid)
            .ok_or_else(|| LinkError::Refused("telemetry characteristic not found".into()))?;
        let command_char = find_characteristic(&peripheral, self.config.command_char_uuid)
            .ok_or_else(|| LinkError::Refused("command characteristic not found".into()))?;

        peripheral
            .subscribe(&telemetry_char)
            .await
            .map_err(|e| LinkError::Refused(format!("notification subscribe failed: {e}")))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| LinkError::Refused(e.to_string()))?;
        let telemetry_uuid = self.config.telemetry_char_uuid;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // The notifications() stream is multiplexed across all subscribed
        // characteristics — dispatch on the notification uuid. The stream
        // ends when the peripheral disconnects, which surfaces as Lost.
        let forward = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != telemetry_uuid {
                    continue;
                }
                if events_tx.send(LinkEvent::Data(notification.value)).is_err() {
                    return;
                }
            }
            let _ = events_tx.send(LinkEvent::Lost(LinkError::Dropped(
                "notification stream ended".into(),
            )));
        });

        info!("connected to {name}");
        Ok(Box::new(BleLink {
            peripheral,
            command_char,
            events: events_rx,
            forward,
        }))
    }
}

struct BleLink {
    peripheral: Peripheral,
    command_char: Characteristic,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    forward: JoinHandle<()>,
}

#[async_trait]
impl LinkHandle for BleLink {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.peripheral
            .write(&self.command_char, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }

    async fn recv(&mut self) -> LinkEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => LinkEvent::Lost(LinkError::Dropped("notification task ended".into())),
        }
    }

    async fn disconnect(&mut self) {
        self.forward.abort();
        if let Err(error) = self.peripheral.disconnect().await {
            debug!("BLE disconnect: {error}");
        }
    }
}

/// Find a GATT characteristic by UUID on the connected peripheral.
fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
}
