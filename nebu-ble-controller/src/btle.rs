//! btleplug implementation of the radio traits

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use nebu_proto::ble::MIN_ATT_PAYLOAD;
use uuid::Uuid;

use crate::radio::{AdvertStream, Advertisement, GattService, Link, NotificationStream, Radio};
use crate::RadioError;

impl From<btleplug::Error> for RadioError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => RadioError::PermissionDenied,
            btleplug::Error::DeviceNotFound => RadioError::NotFound("device not found".to_string()),
            btleplug::Error::NotConnected => RadioError::NotConnected,
            btleplug::Error::NotSupported(m) => RadioError::Unavailable(m),
            other => RadioError::Transport(other.to_string()),
        }
    }
}

/// The host's default Bluetooth adapter
pub struct BtleRadio {
    adapter: Adapter,
    /// Peripherals seen while scanning, keyed by address
    seen: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BtleRadio {
    /// Open the first Bluetooth adapter
    pub async fn new() -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Unavailable("no Bluetooth adapter found".to_string()))?;

        Ok(Self { adapter, seen: Arc::new(Mutex::new(HashMap::new())) })
    }

    async fn find(&self, id: &str) -> Result<Peripheral, RadioError> {
        let cached = self.seen.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned();
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }

        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string() == id {
                return Ok(peripheral);
            }
        }
        Err(RadioError::NotFound(id.to_string()))
    }
}

impl Radio for BtleRadio {
    type Link = BtleLink;

    async fn scan(&self, services: &[Uuid]) -> Result<AdvertStream, RadioError> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter { services: services.to_vec() })
            .await?;

        let adapter = self.adapter.clone();
        let seen = self.seen.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let seen = seen.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let props = peripheral.properties().await.ok()??;
                // Addresses are stable across scans on Linux and Windows
                let key = peripheral.address().to_string();
                seen.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key.clone(), peripheral);

                Some(Advertisement {
                    id: key,
                    name: props.local_name,
                    rssi: props.rssi,
                    // btleplug does not expose the advertising PDU type
                    connectable: true,
                    services: props.services,
                })
            }
        });
        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<BtleLink, RadioError> {
        let peripheral = self.find(id).await?;
        peripheral.connect().await?;
        if !peripheral.is_connected().await? {
            return Err(RadioError::NotConnected);
        }
        Ok(BtleLink { peripheral })
    }
}

pub struct BtleLink {
    peripheral: Peripheral,
}

impl BtleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, RadioError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(RadioError::NoSuchCharacteristic(uuid))
    }
}

impl Link for BtleLink {
    async fn max_payload(&self) -> Result<usize, RadioError> {
        // btleplug does not surface the negotiated ATT MTU, so assume the minimum
        Ok(MIN_ATT_PAYLOAD)
    }

    async fn discover(&self) -> Result<Vec<GattService>, RadioError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, RadioError> {
        let c = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), RadioError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral.write(&c, data, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, RadioError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&c).await?;
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |n| async move { (n.uuid == characteristic).then_some(n.value) })
            .boxed())
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
