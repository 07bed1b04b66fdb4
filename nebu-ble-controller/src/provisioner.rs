//! Credential Provisioner - chunked credential write with acknowledged delivery

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use nebu_proto::ble::{STATUS_CHAR_UUID, WIFI_CONFIG_CHAR_UUID};
use nebu_proto::{Ack, AckCode, CredentialFrame};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::connector::BoundSession;
use crate::radio::Link;
use crate::{ProvisionError, RadioError, WifiCredential};

/// Successful delivery: the toy accepted the credential frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub sequence: u32,
    pub attempts: u32,
}

enum AttemptError {
    Timeout,
    Transport(RadioError),
    Cancelled,
    Encode(String),
}

/// Writes WiFi credentials and waits for the toy's verdict
///
/// Every attempt carries a fresh, strictly increasing sequence number so
/// the toy can drop replays of an older frame.
pub struct Provisioner {
    sequence: AtomicU32,
}

impl Default for Provisioner {
    fn default() -> Self {
        // Seeded from the clock so numbers keep increasing across restarts
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        Self::starting_at(now)
    }
}

impl Provisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first attempt uses `sequence + 1`
    pub fn starting_at(sequence: u32) -> Self {
        Self { sequence: AtomicU32::new(sequence) }
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Deliver `credential`, retrying timeouts and write failures up to `max_retries` times
    ///
    /// `ack-bad-credentials` and `ack-unsupported` end immediately. `timeout`
    /// bounds the subscribe, each chunk write and the ack wait. A chunk write
    /// already in flight is never interrupted by `cancel`; the ack wait is.
    pub async fn provision<L: Link>(
        &self,
        session: &BoundSession<L>,
        credential: &WifiCredential,
        timeout: Duration,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let total = max_retries.saturating_add(1);

        for attempt in 1..=total {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            let sequence = self.next_sequence();
            debug!(peripheral = %session.handle().id, attempt, sequence, "sending credentials");

            match self.attempt(session, credential, sequence, timeout, cancel).await {
                Ok(AckCode::Ok) => {
                    info!(peripheral = %session.handle().id, attempt, sequence, "credentials accepted");
                    return Ok(ProvisionOutcome { sequence, attempts: attempt });
                }
                Ok(AckCode::BadCredentials) => {
                    warn!(peripheral = %session.handle().id, sequence, "credentials rejected");
                    return Err(ProvisionError::BadCredentials { attempts: attempt });
                }
                Ok(AckCode::Unsupported) => {
                    warn!(peripheral = %session.handle().id, sequence, "credential frame unsupported");
                    return Err(ProvisionError::DeviceRejected { attempts: attempt });
                }
                Err(AttemptError::Cancelled) => return Err(ProvisionError::Cancelled),
                Err(AttemptError::Encode(e)) => return Err(ProvisionError::Encode(e)),
                Err(AttemptError::Timeout) => {
                    warn!(peripheral = %session.handle().id, attempt, sequence, "no acknowledgement");
                }
                Err(AttemptError::Transport(e)) => {
                    warn!(peripheral = %session.handle().id, attempt, sequence, "write failed: {e}");
                }
            }
        }

        Err(ProvisionError::Timeout { attempts: total })
    }

    async fn attempt<L: Link>(
        &self,
        session: &BoundSession<L>,
        credential: &WifiCredential,
        sequence: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AckCode, AttemptError> {
        let frame = Zeroizing::new(
            CredentialFrame::encode(sequence, credential.ssid().as_bytes(), credential.passphrase().as_bytes())
                .map_err(|e| AttemptError::Encode(e.to_string()))?,
        );
        let chunks: Vec<Zeroizing<Vec<u8>>> = nebu_proto::chunk_frame(&frame, session.max_payload())
            .map_err(|e| AttemptError::Encode(e.to_string()))?
            .into_iter()
            .map(Zeroizing::new)
            .collect();

        let link = session.link();
        // Subscribe first so a fast acknowledgement is not missed
        let mut acks = tokio::time::timeout(timeout, link.subscribe(STATUS_CHAR_UUID))
            .await
            .map_err(|_| AttemptError::Timeout)?
            .map_err(AttemptError::Transport)?;

        for (index, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            match tokio::time::timeout(timeout, link.write(WIFI_CONFIG_CHAR_UUID, chunk)).await {
                Ok(written) => written.map_err(AttemptError::Transport)?,
                Err(_) => {
                    debug!(sequence, index, "chunk write stalled");
                    return Err(AttemptError::Timeout);
                }
            }
        }
        debug!(sequence, chunks = chunks.len(), "frame written, awaiting acknowledgement");

        let verdict = async {
            while let Some(value) = acks.next().await {
                match Ack::from_bytes(&value) {
                    Ok(ack) if ack.sequence == sequence => return Some(ack.code),
                    Ok(ack) => debug!(sequence, stale = ack.sequence, "ignoring stale acknowledgement"),
                    Err(e) => debug!("ignoring malformed status value: {e}"),
                }
            }
            None
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            result = tokio::time::timeout(timeout, verdict) => match result {
                Ok(Some(code)) => Ok(code),
                Ok(None) => Err(AttemptError::Transport(RadioError::Transport(
                    "status notifications ended".to_string(),
                ))),
                Err(_) => Err(AttemptError::Timeout),
            },
        }
    }
}
