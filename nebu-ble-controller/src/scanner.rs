//! Radio Scanner - discovers advertising toys matching a filter

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::radio::{AdvertStream, Advertisement, Radio};
use crate::{RadioError, ScanError};

pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// A peripheral already reported is reported again only if its RSSI moved by more than this
pub const RSSI_HYSTERESIS_DBM: i32 = 6;

/// Which advertisements a scan reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFilter {
    #[serde(default)]
    pub name_prefixes: Vec<String>,
    #[serde(default)]
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    pub fn names<S: Into<String>>(prefixes: impl IntoIterator<Item = S>) -> Self {
        Self {
            name_prefixes: prefixes.into_iter().map(Into::into).collect(),
            services: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name_prefixes.is_empty() && self.services.is_empty()
    }

    /// Match by name prefix or by any advertised service
    pub fn matches(&self, advert: &Advertisement) -> bool {
        let by_name = advert.name.as_deref().is_some_and(|name| {
            self.name_prefixes.iter().any(|p| {
                // Match "NEBU-xxx" or "nimble [NEBU-xxx]" format
                name.starts_with(p.as_str()) || name.contains(&format!("[{p}"))
            })
        });
        by_name || advert.services.iter().any(|s| self.services.contains(s))
    }

    /// Services the platform can pre-filter on without hiding name matches
    fn platform_services(&self) -> &[Uuid] {
        if self.name_prefixes.is_empty() { self.services.as_slice() } else { &[] }
    }
}

/// A discovered toy, immutable; fresher sightings supersede it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralHandle {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub connectable: bool,
    pub services: Vec<Uuid>,
}

impl From<Advertisement> for PeripheralHandle {
    fn from(a: Advertisement) -> Self {
        Self {
            id: a.id,
            name: a.name,
            rssi: a.rssi,
            connectable: a.connectable,
            services: a.services,
        }
    }
}

pub struct Scanner<R: Radio> {
    radio: Arc<R>,
    active: Mutex<Option<CancellationToken>>,
}

impl<R: Radio> Scanner<R> {
    pub fn new(radio: Arc<R>) -> Self {
        Self { radio, active: Mutex::new(None) }
    }

    /// Start a scan that ends after `duration` (default 10s) or on [`Scanner::stop_scan`]
    ///
    /// Fails immediately when the radio is off or permission is missing.
    pub async fn start_scan(
        &self,
        filter: ScanFilter,
        duration: Option<Duration>,
    ) -> Result<ScanStream<R>, ScanError> {
        if filter.is_empty() {
            return Err(ScanError::InvalidFilter);
        }
        let duration = duration.unwrap_or(DEFAULT_SCAN_DURATION);
        if duration.is_zero() {
            return Err(ScanError::InvalidDuration);
        }

        let adverts = self.radio.scan(filter.platform_services()).await?;
        let stop = CancellationToken::new();
        if let Some(previous) = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(stop.clone())
        {
            previous.cancel();
        }

        info!(prefixes = ?filter.name_prefixes, ?duration, "scan started");

        Ok(ScanStream {
            radio: self.radio.clone(),
            adverts,
            filter,
            deadline: Box::pin(tokio::time::sleep(duration)),
            stop,
            reported: HashMap::new(),
            finished: false,
        })
    }

    /// End the active scan, if any
    pub async fn stop_scan(&self) -> Result<(), RadioError> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        match active {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                self.radio.stop_scan().await
            }
            _ => Ok(()),
        }
    }
}

/// Matching peripherals from one scan
pub struct ScanStream<R: Radio> {
    radio: Arc<R>,
    adverts: AdvertStream,
    filter: ScanFilter,
    deadline: Pin<Box<Sleep>>,
    stop: CancellationToken,
    /// Last RSSI reported per peripheral id
    reported: HashMap<String, Option<i16>>,
    finished: bool,
}

impl<R: Radio> ScanStream<R> {
    /// Next matching peripheral, or `None` once the scan has ended
    pub async fn next(&mut self) -> Option<PeripheralHandle> {
        if self.finished {
            return None;
        }

        loop {
            tokio::select! {
                _ = &mut self.deadline => break,
                _ = self.stop.cancelled() => break,
                advert = self.adverts.next() => match advert {
                    Some(advert) => {
                        if let Some(handle) = self.accept(advert) {
                            return Some(handle);
                        }
                    }
                    None => break,
                },
            }
        }

        self.finish().await;
        None
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// End this scan early
    pub async fn stop(&mut self) {
        if !self.finished {
            self.finish().await;
        }
    }

    async fn finish(&mut self) {
        self.finished = true;
        // A cancelled token means Scanner::stop_scan already stopped the radio
        if !self.stop.is_cancelled() {
            self.stop.cancel();
            if let Err(e) = self.radio.stop_scan().await {
                warn!("failed to stop scan: {e}");
            }
        }
        info!(found = self.reported.len(), "scan finished");
    }

    fn accept(&mut self, advert: Advertisement) -> Option<PeripheralHandle> {
        if !self.filter.matches(&advert) {
            return None;
        }

        if let Some(previous) = self.reported.get(&advert.id) {
            let moved = match (*previous, advert.rssi) {
                (Some(old), Some(new)) => (i32::from(new) - i32::from(old)).abs() > RSSI_HYSTERESIS_DBM,
                (None, Some(_)) => true,
                (_, None) => false,
            };
            if !moved {
                return None;
            }
        }

        debug!(peripheral = %advert.id, name = ?advert.name, rssi = ?advert.rssi, "discovered");
        self.reported.insert(advert.id.clone(), advert.rssi);
        Some(advert.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{advert, FakeRadio, RadioEvent};

    fn scanner(radio: &Arc<FakeRadio>) -> Scanner<FakeRadio> {
        Scanner::new(radio.clone())
    }

    async fn collect(stream: &mut ScanStream<FakeRadio>) -> Vec<PeripheralHandle> {
        let mut out = Vec::new();
        while let Some(handle) = stream.next().await {
            out.push(handle);
        }
        out
    }

    #[test]
    fn filter_matches_prefix_wrapped_name_and_service() {
        let filter = ScanFilter::names(["NEBU-"]);
        assert!(filter.matches(&advert("a", "NEBU-Robot-001", -45)));
        assert!(filter.matches(&advert("b", "nimble [NEBU-Robot-002]", -45)));
        assert!(!filter.matches(&advert("c", "Speaker", -45)));

        let by_service = ScanFilter {
            name_prefixes: Vec::new(),
            services: vec![nebu_proto::ble::WIFI_CONFIG_SERVICE_UUID],
        };
        let mut anonymous = advert("d", "", -50);
        anonymous.name = None;
        assert!(!by_service.matches(&anonymous));
        anonymous.services.push(nebu_proto::ble::WIFI_CONFIG_SERVICE_UUID);
        assert!(by_service.matches(&anonymous));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_each_peripheral_once_unless_rssi_moves() {
        let radio = Arc::new(FakeRadio::new());
        radio.advertise(Duration::from_millis(100), advert("a", "NEBU-Robot-001", -45));
        radio.advertise(Duration::from_millis(100), advert("a", "NEBU-Robot-001", -47));
        radio.advertise(Duration::from_millis(100), advert("b", "Speaker", -30));
        radio.advertise(Duration::from_millis(100), advert("a", "NEBU-Robot-001", -60));
        radio.advertise(Duration::from_millis(100), advert("c", "NEBU-Robot-002", -70));

        let mut stream = scanner(&radio)
            .start_scan(ScanFilter::names(["NEBU-"]), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        let found = collect(&mut stream).await;

        let seen: Vec<_> = found.iter().map(|h| (h.id.as_str(), h.rssi)).collect();
        assert_eq!(seen, [("a", Some(-45)), ("a", Some(-60)), ("c", Some(-70))]);
    }

    #[tokio::test(start_paused = true)]
    async fn ends_at_duration_and_stops_radio() {
        let radio = Arc::new(FakeRadio::new());
        radio.advertise(Duration::from_secs(1), advert("a", "NEBU-Robot-001", -45));
        radio.advertise(Duration::from_secs(20), advert("b", "NEBU-Robot-002", -45));

        let start = tokio::time::Instant::now();
        let mut stream = scanner(&radio)
            .start_scan(ScanFilter::names(["NEBU-"]), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let found = collect(&mut stream).await;

        assert_eq!(found.len(), 1);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
        assert!(stream.is_finished());
        assert!(!radio.is_scanning());
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_scan_ends_stream() {
        let radio = Arc::new(FakeRadio::new());
        radio.advertise(Duration::from_secs(1), advert("a", "NEBU-Robot-001", -45));
        let scanner = scanner(&radio);

        let mut stream = scanner
            .start_scan(ScanFilter::names(["NEBU-"]), None)
            .await
            .unwrap();
        assert!(stream.next().await.is_some());

        scanner.stop_scan().await.unwrap();
        assert_eq!(stream.next().await, None);
        let stops = radio
            .events()
            .into_iter()
            .filter(|e| *e == RadioEvent::ScanStopped)
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn radio_failures_surface_immediately() {
        let radio = Arc::new(FakeRadio::new());
        radio.fail_scan(RadioError::PermissionDenied);
        let err = scanner(&radio)
            .start_scan(ScanFilter::names(["NEBU-"]), None)
            .await
            .err();
        assert_eq!(err, Some(ScanError::PermissionDenied));

        radio.fail_scan(RadioError::Unavailable("powered off".to_string()));
        let err = scanner(&radio)
            .start_scan(ScanFilter::names(["NEBU-"]), None)
            .await
            .err();
        assert_eq!(err, Some(ScanError::RadioUnavailable("powered off".to_string())));
    }

    #[tokio::test]
    async fn rejects_empty_filter_and_zero_duration() {
        let radio = Arc::new(FakeRadio::new());
        let scanner = scanner(&radio);
        assert_eq!(
            scanner.start_scan(ScanFilter::default(), None).await.err(),
            Some(ScanError::InvalidFilter)
        );
        assert_eq!(
            scanner
                .start_scan(ScanFilter::names(["NEBU-"]), Some(Duration::ZERO))
                .await
                .err(),
            Some(ScanError::InvalidDuration)
        );
        assert!(radio.events().is_empty());
    }
}
