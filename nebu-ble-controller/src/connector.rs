//! Link Connector - owns the single radio link

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::radio::{Link, Radio};
use crate::scanner::PeripheralHandle;
use crate::{ConnectError, RadioError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Idle,
    Connecting(String),
    Bound(String),
}

/// Releases the connector slot when dropped
struct SlotGuard {
    slot: Arc<Mutex<Slot>>,
}

impl SlotGuard {
    fn bind(&self, id: &str) {
        *lock(&self.slot) = Slot::Bound(id.to_string());
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *lock(&self.slot) = Slot::Idle;
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// An open link to one toy. At most one exists per connector.
///
/// Dropping it without [`Connector::disconnect`] frees the connector for a
/// new bind but leaves the platform link to time out on its own.
pub struct BoundSession<L: Link> {
    handle: PeripheralHandle,
    attempt: u64,
    connected_at: SystemTime,
    max_payload: usize,
    link: L,
    _slot: SlotGuard,
}

impl<L: Link> BoundSession<L> {
    pub fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// Process-wide connect attempt number that produced this session
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Largest single write the link accepts
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn link(&self) -> &L {
        &self.link
    }
}

impl<L: Link> std::fmt::Debug for BoundSession<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundSession")
            .field("peripheral", &self.handle.id)
            .field("attempt", &self.attempt)
            .field("max_payload", &self.max_payload)
            .finish()
    }
}

/// Opens and closes the radio link
///
/// Shared by every provisioning session; its slot is what keeps two
/// sessions from binding at once.
pub struct Connector<R: Radio> {
    radio: Arc<R>,
    slot: Arc<Mutex<Slot>>,
    attempts: AtomicU64,
}

impl<R: Radio> Connector<R> {
    pub fn new(radio: Arc<R>) -> Self {
        Self {
            radio,
            slot: Arc::new(Mutex::new(Slot::Idle)),
            attempts: AtomicU64::new(0),
        }
    }

    /// Single bounded connect attempt, no retry
    ///
    /// Succeeds once the link is up and its write payload size is known.
    /// `timeout` covers both steps. On timeout the attempt is dropped, a link
    /// that already came up is disconnected, and no session remains.
    pub async fn connect(
        &self,
        handle: &PeripheralHandle,
        timeout: Duration,
    ) -> Result<BoundSession<R::Link>, ConnectError> {
        let guard = self.claim(&handle.id)?;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(peripheral = %handle.id, attempt, ?timeout, "connecting");

        let started = tokio::time::Instant::now();
        let link = match tokio::time::timeout(timeout, self.radio.connect(&handle.id)).await {
            Err(_) => {
                warn!(peripheral = %handle.id, attempt, "connect timed out");
                return Err(ConnectError::Timeout(timeout));
            }
            Ok(Err(e)) => {
                warn!(peripheral = %handle.id, attempt, "connect failed: {e}");
                return Err(ConnectError::Failed(e));
            }
            Ok(Ok(link)) => link,
        };

        // the link is up; anything short of a session closes it again
        let remaining = timeout.saturating_sub(started.elapsed());
        let max_payload = match tokio::time::timeout(remaining, link.max_payload()).await {
            Ok(Ok(max_payload)) => max_payload,
            failed => {
                let error = match failed {
                    Ok(Err(e)) => {
                        warn!(peripheral = %handle.id, attempt, "connect failed: {e}");
                        ConnectError::Failed(e)
                    }
                    _ => {
                        warn!(peripheral = %handle.id, attempt, "connect timed out waiting for link parameters");
                        ConnectError::Timeout(timeout)
                    }
                };
                if tokio::time::timeout(timeout, link.disconnect()).await.is_err() {
                    warn!(peripheral = %handle.id, attempt, "disconnect after failed connect timed out");
                }
                return Err(error);
            }
        };

        guard.bind(&handle.id);
        info!(peripheral = %handle.id, attempt, max_payload, "connected");
        Ok(BoundSession {
            handle: handle.clone(),
            attempt,
            connected_at: SystemTime::now(),
            max_payload,
            link,
            _slot: guard,
        })
    }

    /// Close the link. The slot is released even if the radio reports an error.
    pub async fn disconnect(&self, session: BoundSession<R::Link>) -> Result<(), RadioError> {
        let result = session.link.disconnect().await;
        info!(peripheral = %session.handle.id, "disconnected");
        drop(session);
        result
    }

    /// Id of the currently bound peripheral
    pub fn bound_peripheral(&self) -> Option<String> {
        match &*lock(&self.slot) {
            Slot::Bound(id) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        *lock(&self.slot) == Slot::Idle
    }

    fn claim(&self, id: &str) -> Result<SlotGuard, ConnectError> {
        let mut slot = lock(&self.slot);
        match &*slot {
            Slot::Bound(_) => Err(ConnectError::AlreadyBound),
            Slot::Connecting(_) => Err(ConnectError::InFlight),
            Slot::Idle => {
                *slot = Slot::Connecting(id.to_string());
                Ok(SlotGuard { slot: self.slot.clone() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{advert, FakePeripheral, FakeRadio, RadioEvent};

    fn handle(id: &str) -> PeripheralHandle {
        advert(id, &format!("NEBU-{id}"), -50).into()
    }

    fn radio_with(ids: &[&str]) -> Arc<FakeRadio> {
        let radio = Arc::new(FakeRadio::new());
        for id in ids {
            radio.add(id, FakePeripheral::toy(id));
        }
        radio
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reads_payload_size() {
        let radio = Arc::new(FakeRadio::new());
        radio.add("a", FakePeripheral::toy("a").max_payload(185));
        let connector = Connector::new(radio.clone());

        let session = connector.connect(&handle("a"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(session.max_payload(), 185);
        assert_eq!(session.handle().id, "a");
        assert_eq!(connector.bound_peripheral().as_deref(), Some("a"));

        connector.disconnect(session).await.unwrap();
        assert!(connector.is_idle());
        assert_eq!(radio.open_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_is_rejected_while_bound() {
        let radio = radio_with(&["a", "b"]);
        let connector = Connector::new(radio.clone());

        let first = connector.connect(&handle("a"), Duration::from_secs(5)).await.unwrap();
        let second = connector.connect(&handle("b"), Duration::from_secs(5)).await;
        assert_eq!(second.err(), Some(ConnectError::AlreadyBound));
        let again = connector.connect(&handle("a"), Duration::from_secs(5)).await;
        assert_eq!(again.err(), Some(ConnectError::AlreadyBound));
        assert_eq!(radio.open_links(), 1);

        connector.disconnect(first).await.unwrap();
        let second = connector.connect(&handle("b"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(second.attempt(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connect_is_in_flight() {
        let radio = Arc::new(FakeRadio::new());
        radio.add("a", FakePeripheral::toy("a").connect_after(Duration::from_secs(2)));
        let connector = Connector::new(radio.clone());

        let h = handle("a");
        let (first, second) = tokio::join!(
            connector.connect(&h, Duration::from_secs(5)),
            connector.connect(&h, Duration::from_secs(5)),
        );
        assert!(first.is_ok());
        assert_eq!(second.err(), Some(ConnectError::InFlight));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_no_session() {
        let radio = Arc::new(FakeRadio::new());
        radio.add("a", FakePeripheral::toy("a").hang_connect());
        let connector = Connector::new(radio.clone());

        let start = tokio::time::Instant::now();
        let result = connector.connect(&handle("a"), Duration::from_secs(3)).await;
        assert_eq!(result.err(), Some(ConnectError::Timeout(Duration::from_secs(3))));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(connector.is_idle());
        assert_eq!(radio.open_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_link_up_disconnects() {
        let radio = Arc::new(FakeRadio::new());
        radio.add("a", FakePeripheral::toy("a").hang_max_payload());
        let connector = Connector::new(radio.clone());

        let result = connector.connect(&handle("a"), Duration::from_secs(2)).await;
        assert_eq!(result.err(), Some(ConnectError::Timeout(Duration::from_secs(2))));
        assert!(connector.is_idle());
        assert_eq!(radio.open_links(), 0);
        let disconnects = radio.events().iter().filter(|e| matches!(e, RadioEvent::Disconnected(_))).count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn failure_releases_slot() {
        let radio = Arc::new(FakeRadio::new());
        radio.add(
            "a",
            FakePeripheral::toy("a").fail_connect(RadioError::Transport("le-connection-abort".to_string())),
        );
        let connector = Connector::new(radio.clone());

        let result = connector.connect(&handle("a"), Duration::from_secs(3)).await;
        assert!(matches!(result, Err(ConnectError::Failed(RadioError::Transport(_)))));
        assert!(connector.is_idle());

        // next scripted attempt succeeds
        assert!(connector.connect(&handle("a"), Duration::from_secs(3)).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_session_frees_slot() {
        let radio = radio_with(&["a"]);
        let connector = Connector::new(radio.clone());
        let session = connector.connect(&handle("a"), Duration::from_secs(3)).await.unwrap();
        drop(session);
        assert!(connector.is_idle());
    }
}
