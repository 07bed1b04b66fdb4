//! Radio abstraction
//!
//! The controller talks to the platform BLE stack only through these two
//! traits. `btle` implements them with btleplug; the `testing` feature
//! provides a scripted implementation.

use std::future::Future;

use futures::stream::BoxStream;
use uuid::Uuid;

use crate::RadioError;

pub type AdvertStream = BoxStream<'static, Advertisement>;
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Raw advertisement as reported by the radio, before filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub connectable: bool,
    pub services: Vec<Uuid>,
}

/// A discovered primary service and its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Central-role access to the BLE radio
pub trait Radio: Send + Sync + 'static {
    type Link: Link;

    /// Start scanning. `services` is a platform-level pre-filter, empty for all.
    fn scan(&self, services: &[Uuid]) -> impl Future<Output = Result<AdvertStream, RadioError>> + Send;

    fn stop_scan(&self) -> impl Future<Output = Result<(), RadioError>> + Send;

    /// Open a link. Resolves once the platform reports the peripheral connected.
    fn connect(&self, id: &str) -> impl Future<Output = Result<Self::Link, RadioError>> + Send;
}

/// An open GATT link to one peripheral
pub trait Link: Send + Sync + 'static {
    /// Largest value a single write may carry
    fn max_payload(&self) -> impl Future<Output = Result<usize, RadioError>> + Send;

    fn discover(&self) -> impl Future<Output = Result<Vec<GattService>, RadioError>> + Send;

    fn read(&self, characteristic: Uuid) -> impl Future<Output = Result<Vec<u8>, RadioError>> + Send;

    /// Write with response
    fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
    ) -> impl Future<Output = Result<(), RadioError>> + Send;

    fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<NotificationStream, RadioError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), RadioError>> + Send;
}
