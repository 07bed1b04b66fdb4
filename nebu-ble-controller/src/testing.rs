//! Scripted in-memory radio
//!
//! Behaves like a room full of toys: adverts arrive on a schedule, connects
//! succeed, fail or hang as scripted, and each toy reassembles credential
//! frames and answers on its status characteristic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use nebu_proto::ble::{
    Surface, CONTROL_CHAR_UUID, DEVICE_INFO_CHAR_UUID, MIN_ATT_PAYLOAD, WIFI_CONFIG_CHAR_UUID,
};
use nebu_proto::{Ack, AckCode, ChunkAssembler, CredentialFrame};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::radio::{AdvertStream, Advertisement, GattService, Link, NotificationStream, Radio};
use crate::RadioError;

/// Build an advertisement for a named peripheral
pub fn advert(id: &str, name: &str, rssi: i16) -> Advertisement {
    Advertisement {
        id: id.to_string(),
        name: Some(name.to_string()),
        rssi: Some(rssi),
        connectable: true,
        services: Vec::new(),
    }
}

/// Everything the fake radio was asked to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    ScanStarted,
    ScanStopped,
    ConnectAttempt(String),
    Connected(String),
    Disconnected(String),
    Discovered(String),
    Read(Uuid),
    Write { characteristic: Uuid, len: usize },
    FrameDelivered(u32),
    Command(u8),
}

#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    Succeed(Duration),
    Fail(RadioError),
    Hang,
}

/// What a toy does after a complete credential frame arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckBehavior {
    Reply(AckCode),
    /// Acknowledge an older sequence first, then reply
    StaleThenReply(AckCode),
    Silent,
    /// Fail the final chunk write
    FailWrite,
    /// Never complete the final chunk write
    HangWrite,
}

#[derive(Debug, Clone)]
pub struct FakePeripheral {
    connects: VecDeque<ConnectBehavior>,
    acks: VecDeque<AckBehavior>,
    services: Vec<GattService>,
    device_info: Vec<u8>,
    max_payload: usize,
    hang_max_payload: bool,
    hang_discover: bool,
}

impl FakePeripheral {
    /// A compliant toy exposing all four surfaces
    pub fn toy(device_id: &str) -> Self {
        let services = Surface::ALL
            .iter()
            .map(|s| GattService { uuid: s.service_uuid(), characteristics: vec![s.characteristic_uuid()] })
            .collect();
        let device_info = serde_json::json!({
            "deviceId": device_id,
            "model": "nebu-robot",
            "firmwareVersion": "1.4.0",
        });
        Self {
            connects: VecDeque::new(),
            acks: VecDeque::new(),
            services,
            device_info: device_info.to_string().into_bytes(),
            max_payload: MIN_ATT_PAYLOAD,
            hang_max_payload: false,
            hang_discover: false,
        }
    }

    pub fn without(mut self, surface: Surface) -> Self {
        self.services.retain(|s| s.uuid != surface.service_uuid());
        self
    }

    pub fn device_info(mut self, raw: Vec<u8>) -> Self {
        self.device_info = raw;
        self
    }

    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Connects, then never reports a write size
    pub fn hang_max_payload(mut self) -> Self {
        self.hang_max_payload = true;
        self
    }

    /// Service discovery never completes
    pub fn hang_discover(mut self) -> Self {
        self.hang_discover = true;
        self
    }

    pub fn connect_after(mut self, delay: Duration) -> Self {
        self.connects.push_back(ConnectBehavior::Succeed(delay));
        self
    }

    pub fn fail_connect(mut self, error: RadioError) -> Self {
        self.connects.push_back(ConnectBehavior::Fail(error));
        self
    }

    pub fn hang_connect(mut self) -> Self {
        self.connects.push_back(ConnectBehavior::Hang);
        self
    }

    /// Queue the reaction to the next credential frame. Unscripted frames get `ack-ok`.
    pub fn ack(mut self, behavior: AckBehavior) -> Self {
        self.acks.push_back(behavior);
        self
    }
}

#[derive(Default)]
struct FakeState {
    scan_error: Option<RadioError>,
    adverts: Vec<(Duration, Advertisement)>,
    peripherals: HashMap<String, FakePeripheral>,
    events: Vec<RadioEvent>,
    scanning: bool,
    open_links: usize,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Default)]
pub struct FakeRadio {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an advert `delay` after the previous one
    pub fn advertise(&self, delay: Duration, advert: Advertisement) {
        lock(&self.state).adverts.push((delay, advert));
    }

    pub fn add(&self, id: &str, peripheral: FakePeripheral) {
        lock(&self.state).peripherals.insert(id.to_string(), peripheral);
    }

    pub fn fail_scan(&self, error: RadioError) {
        lock(&self.state).scan_error = Some(error);
    }

    pub fn events(&self) -> Vec<RadioEvent> {
        lock(&self.state).events.clone()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    pub fn open_links(&self) -> usize {
        lock(&self.state).open_links
    }

    /// Sequence numbers of frames the toys received in full
    pub fn frames_delivered(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RadioEvent::FrameDelivered(sequence) => Some(sequence),
                _ => None,
            })
            .collect()
    }

    pub fn chunks_written(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, RadioEvent::Write { characteristic, .. } if *characteristic == WIFI_CONFIG_CHAR_UUID))
            .count()
    }

    fn record(&self, event: RadioEvent) {
        lock(&self.state).events.push(event);
    }
}

impl Radio for FakeRadio {
    type Link = FakeLink;

    async fn scan(&self, _services: &[Uuid]) -> Result<AdvertStream, RadioError> {
        let adverts = {
            let mut state = lock(&self.state);
            if let Some(e) = state.scan_error.clone() {
                return Err(e);
            }
            state.scanning = true;
            state.events.push(RadioEvent::ScanStarted);
            state.adverts.clone()
        };

        Ok(futures::stream::iter(adverts)
            .then(|(delay, advert)| async move {
                tokio::time::sleep(delay).await;
                advert
            })
            .chain(futures::stream::pending())
            .boxed())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        let mut state = lock(&self.state);
        state.scanning = false;
        state.events.push(RadioEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<FakeLink, RadioError> {
        let behavior = {
            let mut state = lock(&self.state);
            state.events.push(RadioEvent::ConnectAttempt(id.to_string()));
            let peripheral = state
                .peripherals
                .get_mut(id)
                .ok_or_else(|| RadioError::NotFound(id.to_string()))?;
            peripheral
                .connects
                .pop_front()
                .unwrap_or(ConnectBehavior::Succeed(Duration::ZERO))
        };

        match behavior {
            ConnectBehavior::Succeed(delay) => tokio::time::sleep(delay).await,
            ConnectBehavior::Fail(e) => return Err(e),
            ConnectBehavior::Hang => futures::future::pending::<()>().await,
        }

        let mut state = lock(&self.state);
        state.open_links += 1;
        state.events.push(RadioEvent::Connected(id.to_string()));
        Ok(FakeLink {
            id: id.to_string(),
            radio: self.clone(),
            connected: AtomicBool::new(true),
            assembler: Mutex::new(ChunkAssembler::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }
}

pub struct FakeLink {
    id: String,
    radio: FakeRadio,
    connected: AtomicBool,
    assembler: Mutex<ChunkAssembler>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl FakeLink {
    fn ensure_connected(&self) -> Result<(), RadioError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RadioError::NotConnected)
        }
    }

    fn has_characteristic(&self, uuid: Uuid) -> bool {
        lock(&self.radio.state)
            .peripherals
            .get(&self.id)
            .is_some_and(|p| p.services.iter().any(|s| s.characteristics.contains(&uuid)))
    }

    fn notify(&self, ack: Ack) {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for tx in subscribers.iter() {
            let _ = tx.send(ack.to_bytes());
        }
    }

    /// True when the write should stall
    fn receive_chunk(&self, chunk: &[u8]) -> Result<bool, RadioError> {
        let frame = self
            .assembler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(chunk)
            .map_err(|e| RadioError::Transport(e.to_string()))?;
        let Some(frame) = frame else {
            return Ok(false);
        };

        let behavior = lock(&self.radio.state)
            .peripherals
            .get_mut(&self.id)
            .and_then(|p| p.acks.pop_front())
            .unwrap_or(AckBehavior::Reply(AckCode::Ok));
        match behavior {
            AckBehavior::FailWrite => return Err(RadioError::Transport("write not permitted".to_string())),
            AckBehavior::HangWrite => return Ok(true),
            _ => {}
        }

        let sequence = CredentialFrame::from_bytes(&frame)
            .map_err(|e| RadioError::Transport(e.to_string()))?
            .sequence;
        self.radio.record(RadioEvent::FrameDelivered(sequence));

        match behavior {
            AckBehavior::Reply(code) => self.notify(Ack { code, sequence }),
            AckBehavior::StaleThenReply(code) => {
                self.notify(Ack { code: AckCode::Ok, sequence: sequence.wrapping_sub(1) });
                self.notify(Ack { code, sequence });
            }
            AckBehavior::Silent | AckBehavior::FailWrite | AckBehavior::HangWrite => {}
        }
        Ok(false)
    }
}

impl Link for FakeLink {
    async fn max_payload(&self) -> Result<usize, RadioError> {
        self.ensure_connected()?;
        let (hang, max_payload) = lock(&self.radio.state)
            .peripherals
            .get(&self.id)
            .map_or((false, MIN_ATT_PAYLOAD), |p| (p.hang_max_payload, p.max_payload));
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(max_payload)
    }

    async fn discover(&self) -> Result<Vec<GattService>, RadioError> {
        self.ensure_connected()?;
        let (hang, services) = {
            let mut state = lock(&self.radio.state);
            state.events.push(RadioEvent::Discovered(self.id.clone()));
            state
                .peripherals
                .get(&self.id)
                .map(|p| (p.hang_discover, p.services.clone()))
                .unwrap_or_default()
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(services)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, RadioError> {
        self.ensure_connected()?;
        if !self.has_characteristic(characteristic) {
            return Err(RadioError::NoSuchCharacteristic(characteristic));
        }
        let mut state = lock(&self.radio.state);
        state.events.push(RadioEvent::Read(characteristic));
        if characteristic == DEVICE_INFO_CHAR_UUID {
            Ok(state
                .peripherals
                .get(&self.id)
                .map(|p| p.device_info.clone())
                .unwrap_or_default())
        } else {
            Ok(Vec::new())
        }
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), RadioError> {
        self.ensure_connected()?;
        if !self.has_characteristic(characteristic) {
            return Err(RadioError::NoSuchCharacteristic(characteristic));
        }
        self.radio.record(RadioEvent::Write { characteristic, len: data.len() });

        if characteristic == WIFI_CONFIG_CHAR_UUID {
            if self.receive_chunk(data)? {
                futures::future::pending::<()>().await;
            }
        } else if characteristic == CONTROL_CHAR_UUID {
            if let Some(&command) = data.first() {
                self.radio.record(RadioEvent::Command(command));
                if command == nebu_proto::ble::commands::ABORT {
                    self.assembler.lock().unwrap_or_else(|e| e.into_inner()).reset();
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, RadioError> {
        self.ensure_connected()?;
        if !self.has_characteristic(characteristic) {
            return Err(RadioError::NoSuchCharacteristic(characteristic));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).push(tx);

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })
        .boxed())
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).clear();
            let mut state = lock(&self.radio.state);
            state.open_links -= 1;
            state.events.push(RadioEvent::Disconnected(self.id.clone()));
        }
        Ok(())
    }
}
