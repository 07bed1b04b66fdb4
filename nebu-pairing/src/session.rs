//! Provisioning Session - the one state machine the UI drives
//!
//! A session walks a single toy from discovery to a backend ownership
//! record. Commands take `&mut self`, so the pipeline is strictly
//! sequential; every wait inside it is bounded and observes cancellation.

use std::future::Future;
use std::sync::Arc;

use nebu_ble_controller::{
    BoundSession, CapabilitySet, ConnectError, Connector, CredentialError, DeviceInfo, Link, PeripheralHandle,
    ProvisionError, Provisioner, Radio, ScanError, ScanStream, Scanner, WifiCredential,
};
use nebu_proto::ble::{CONTROL_CHAR_UUID, commands};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PairingConfig};
use crate::registrar::OwnershipApi;
use crate::state::{ErrorKind, SessionError, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("`{command}` is not allowed while {state}")]
    InvalidState { command: &'static str, state: SessionState },
    #[error("session already ended: {0}")]
    Finished(SessionState),
    #[error("peripheral {0} was not discovered in this scan")]
    UnknownPeripheral(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Scan(ScanError),
}

/// Requests cancellation from another task
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAttempts {
    pub connect: u32,
    pub provision: u32,
}

/// Read-only view of a session for the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub state: SessionState,
    pub discovered: Vec<PeripheralHandle>,
    pub last_error: Option<SessionError>,
    pub awaiting_credential: bool,
    pub firmware_update_required: bool,
    pub device: Option<DeviceInfo>,
    pub attempts: StageAttempts,
}

/// Collaborators shared by every session in the process
///
/// Holds the one [`Scanner`] and the one [`Connector`], so sessions created
/// from the same context never stop each other's scan and can never bind two
/// toys at once. A newer scan supersedes an older one.
pub struct PairingContext<R: Radio, A: OwnershipApi> {
    scanner: Arc<Scanner<R>>,
    connector: Arc<Connector<R>>,
    provisioner: Arc<Provisioner>,
    registrar: Arc<A>,
    config: PairingConfig,
}

impl<R: Radio, A: OwnershipApi> Clone for PairingContext<R, A> {
    fn clone(&self) -> Self {
        Self {
            scanner: self.scanner.clone(),
            connector: self.connector.clone(),
            provisioner: self.provisioner.clone(),
            registrar: self.registrar.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R: Radio, A: OwnershipApi> PairingContext<R, A> {
    pub fn new(radio: Arc<R>, registrar: Arc<A>, config: PairingConfig) -> Result<Self, ConfigError> {
        Self::with_provisioner(radio, registrar, config, Provisioner::new())
    }

    pub fn with_provisioner(
        radio: Arc<R>,
        registrar: Arc<A>,
        config: PairingConfig,
        provisioner: Provisioner,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            scanner: Arc::new(Scanner::new(radio.clone())),
            connector: Arc::new(Connector::new(radio)),
            provisioner: Arc::new(provisioner),
            registrar,
            config,
        })
    }

    pub fn connector(&self) -> &Arc<Connector<R>> {
        &self.connector
    }

    pub fn registrar(&self) -> &Arc<A> {
        &self.registrar
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    pub fn session(&self) -> ProvisioningSession<R, A> {
        ProvisioningSession::new(self.clone())
    }
}

pub struct ProvisioningSession<R: Radio, A: OwnershipApi> {
    ctx: PairingContext<R, A>,
    state: SessionState,
    scan: Option<ScanStream<R>>,
    discovered: Vec<PeripheralHandle>,
    bound: Option<BoundSession<R::Link>>,
    capabilities: Option<CapabilitySet>,
    device: Option<DeviceInfo>,
    credential: Option<WifiCredential>,
    awaiting_credential: bool,
    firmware_update_required: bool,
    attempts: StageAttempts,
    last_error: Option<SessionError>,
    cancel: CancellationToken,
}

/// Runs `fut` unless `cancel` fires first
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

impl<R: Radio, A: OwnershipApi> ProvisioningSession<R, A> {
    fn new(ctx: PairingContext<R, A>) -> Self {
        Self {
            ctx,
            state: SessionState::Idle,
            scan: None,
            discovered: Vec::new(),
            bound: None,
            capabilities: None,
            device: None,
            credential: None,
            awaiting_credential: false,
            firmware_update_required: false,
            attempts: StageAttempts::default(),
            last_error: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            discovered: self.discovered.clone(),
            last_error: self.last_error.clone(),
            awaiting_credential: self.awaiting_credential,
            firmware_update_required: self.firmware_update_required,
            device: self.device.clone(),
            attempts: self.attempts,
        }
    }

    /// `Idle -> Scanning`
    pub async fn start(&mut self) -> Result<(), CommandError> {
        self.enter_command("start", |s| *s == SessionState::Idle).await?;

        let config = &self.ctx.config;
        let filter = config.scan_filter();
        let duration = config.scan_duration();
        self.transition(SessionState::Scanning);

        match self.ctx.scanner.start_scan(filter, Some(duration)).await {
            Ok(stream) => {
                self.scan = Some(stream);
                Ok(())
            }
            Err(e @ (ScanError::InvalidFilter | ScanError::InvalidDuration)) => {
                self.transition(SessionState::Idle);
                Err(CommandError::Scan(e))
            }
            Err(e) => {
                self.fail(e.into()).await;
                Ok(())
            }
        }
    }

    /// Next matching toy from the running scan, `None` once the window closes
    pub async fn next_discovery(&mut self) -> Result<Option<PeripheralHandle>, CommandError> {
        self.enter_command("next_discovery", |s| *s == SessionState::Scanning).await?;

        let Some(scan) = self.scan.as_mut() else {
            return Ok(None);
        };
        match until_cancelled(&self.cancel, scan.next()).await {
            None => {
                self.finish_cancelled().await;
                Ok(None)
            }
            Some(None) => {
                self.scan = None;
                Ok(None)
            }
            Some(Some(handle)) => {
                match self.discovered.iter_mut().find(|h| h.id == handle.id) {
                    Some(existing) => *existing = handle.clone(),
                    None => self.discovered.push(handle.clone()),
                }
                Ok(Some(handle))
            }
        }
    }

    /// Bind the discovered toy `id` and verify it
    ///
    /// Continues straight into provisioning when a credential was already
    /// provided; otherwise waits in `CapabilityCheck` for one.
    pub async fn select(&mut self, id: &str) -> Result<(), CommandError> {
        self.enter_command("select", |s| *s == SessionState::Scanning).await?;
        let handle = self
            .discovered
            .iter()
            .find(|h| h.id == id)
            .cloned()
            .ok_or_else(|| CommandError::UnknownPeripheral(id.to_string()))?;

        self.stop_scan().await;
        info!(peripheral = %handle.id, name = ?handle.name, "device selected");
        self.transition(SessionState::DeviceSelected);
        self.transition(SessionState::Connecting);

        let Some(bound) = self.connect_with_retry(&handle).await else {
            return Ok(());
        };
        self.bound = Some(bound);
        self.transition(SessionState::CapabilityCheck);

        if !self.check_capabilities().await {
            return Ok(());
        }

        if self.credential.is_some() {
            self.provision_and_register().await;
        } else {
            self.awaiting_credential = true;
            debug!("waiting for credentials");
        }
        Ok(())
    }

    /// Hold WiFi credentials for this session
    ///
    /// Invalid input leaves the session untouched. If the session is waiting
    /// in `CapabilityCheck` the pipeline continues immediately.
    pub async fn provide_credential(&mut self, ssid: &str, passphrase: &str) -> Result<(), CommandError> {
        self.enter_command("provide_credential", |s| {
            matches!(
                s,
                SessionState::Idle
                    | SessionState::Scanning
                    | SessionState::DeviceSelected
                    | SessionState::Connecting
                    | SessionState::CapabilityCheck
            )
        })
        .await?;

        let credential = WifiCredential::new(ssid, passphrase)?;
        debug!(ssid_len = credential.ssid().len(), "credentials provided");
        self.credential = Some(credential);

        if self.awaiting_credential {
            self.provision_and_register().await;
        }
        Ok(())
    }

    /// Abort the session. Terminal states are kept; resources are released either way.
    pub async fn cancel(&mut self) {
        self.cancel.cancel();
        if self.state.is_terminal() {
            self.release(false).await;
        } else {
            self.finish_cancelled().await;
        }
    }

    async fn enter_command(
        &mut self,
        command: &'static str,
        allowed: impl Fn(&SessionState) -> bool,
    ) -> Result<(), CommandError> {
        if self.cancel.is_cancelled() && !self.state.is_terminal() {
            self.finish_cancelled().await;
        }
        if self.state.is_terminal() {
            return Err(CommandError::Finished(self.state.clone()));
        }
        if !allowed(&self.state) {
            return Err(CommandError::InvalidState { command, state: self.state.clone() });
        }
        Ok(())
    }

    async fn connect_with_retry(&mut self, handle: &PeripheralHandle) -> Option<BoundSession<R::Link>> {
        let config = self.ctx.config.clone();
        let mut last = None;

        for attempt in 1..=config.connect_attempts {
            self.attempts.connect = attempt;
            let connecting = self.ctx.connector.connect(handle, config.connect_timeout());
            let result = match until_cancelled(&self.cancel, connecting).await {
                Some(result) => result,
                None => {
                    self.finish_cancelled().await;
                    return None;
                }
            };

            match result {
                Ok(bound) => return Some(bound),
                Err(e @ (ConnectError::AlreadyBound | ConnectError::InFlight)) => {
                    warn!(peripheral = %handle.id, "connector busy: {e}");
                    self.fail(SessionError::new(ErrorKind::ConnectFailed, e.to_string())).await;
                    return None;
                }
                Err(e) => {
                    debug!(peripheral = %handle.id, attempt, "connect attempt failed: {e}");
                    last = Some(e);
                }
            }

            if attempt < config.connect_attempts {
                let backoff = config.connect_backoff_after(attempt);
                if until_cancelled(&self.cancel, tokio::time::sleep(backoff)).await.is_none() {
                    self.finish_cancelled().await;
                    return None;
                }
            }
        }

        let error = match last {
            Some(e) => e.into(),
            None => SessionError::new(ErrorKind::ConnectFailed, "no connect attempt made"),
        };
        self.fail(error).await;
        None
    }

    /// Verify surfaces and read the device identity. False if the session ended.
    async fn check_capabilities(&mut self) -> bool {
        let Some(bound) = self.bound.as_ref() else {
            return false;
        };

        let timeout = self.ctx.config.capability_timeout();
        let checking = tokio::time::timeout(timeout, async {
            let capabilities = nebu_ble_controller::verify(bound).await?;
            let device = nebu_ble_controller::read_device_info(bound, &capabilities).await?;
            Ok::<_, nebu_ble_controller::VerifyError>((capabilities, device))
        });

        let checked = until_cancelled(&self.cancel, checking).await;
        match checked {
            None => {
                self.finish_cancelled().await;
                false
            }
            Some(Err(_)) => {
                let message = format!("capability check timed out after {timeout:?}");
                self.fail(SessionError::new(ErrorKind::ConnectTimeout, message)).await;
                false
            }
            Some(Ok(Err(e))) => {
                self.fail(e.into()).await;
                false
            }
            Some(Ok(Ok((capabilities, device)))) => {
                info!(device_id = %device.device_id, firmware = ?device.firmware_version, "device verified");
                self.capabilities = Some(capabilities);
                self.device = Some(device);
                true
            }
        }
    }

    /// `Provisioning -> BackendValidating -> Complete`
    async fn provision_and_register(&mut self) {
        self.awaiting_credential = false;
        self.transition(SessionState::Provisioning);

        let (Some(bound), Some(credential)) = (self.bound.as_ref(), self.credential.as_ref()) else {
            self.fail(SessionError::new(ErrorKind::ConnectFailed, "no bound peripheral")).await;
            return;
        };
        let config = &self.ctx.config;
        let result = self
            .ctx
            .provisioner
            .provision(
                bound,
                credential,
                config.provision_timeout(),
                config.provision_retries,
                &self.cancel,
            )
            .await;

        match result {
            Ok(outcome) => {
                self.attempts.provision = outcome.attempts;
                // the toy has the network now; our copy is no longer needed
                self.credential = None;
            }
            Err(ProvisionError::Cancelled) => {
                self.finish_cancelled().await;
                return;
            }
            Err(e) => {
                if let Some(attempts) = e.attempts() {
                    self.attempts.provision = attempts;
                }
                self.fail(e.into()).await;
                return;
            }
        }

        self.transition(SessionState::BackendValidating);
        match self.register().await {
            Some(Ok(())) => {
                self.transition(SessionState::Complete);
                self.release(false).await;
            }
            Some(Err(e)) => self.fail(e).await,
            None => self.finish_cancelled().await,
        }
    }

    /// `None` when cancelled
    async fn register(&mut self) -> Option<Result<(), SessionError>> {
        let registrar = self.ctx.registrar.clone();
        let cancel = self.cancel.clone();
        let Some(device_id) = self.device.as_ref().map(|d| d.device_id.clone()) else {
            return Some(Err(SessionError::new(ErrorKind::RegistrationFailed, "device identity unknown")));
        };

        let validation = match until_cancelled(&cancel, registrar.validate(&device_id)).await? {
            Ok(v) => v,
            Err(e) => return Some(Err(e.into())),
        };
        if !validation.is_valid {
            return Some(Err(SessionError::new(
                ErrorKind::RegistrationFailed,
                format!("backend does not recognise device {device_id}"),
            )));
        }
        self.firmware_update_required = validation.requires_update;
        if validation.requires_update {
            info!(%device_id, "firmware update required");
        }

        let Some(user_id) = self.ctx.config.user_id.clone() else {
            return Some(Err(SessionError::new(ErrorKind::RegistrationFailed, "no user id configured")));
        };
        let response = match until_cancelled(&cancel, registrar.register(&device_id, &user_id)).await? {
            Ok(r) => r,
            Err(e) => return Some(Err(e.into())),
        };
        if !response.success {
            let message = response.error.unwrap_or_else(|| "registration refused".to_string());
            return Some(Err(SessionError::new(ErrorKind::RegistrationFailed, message)));
        }

        info!(%device_id, %user_id, "device registered");
        Some(Ok(()))
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "session transition");
        self.state = next;
    }

    async fn fail(&mut self, error: SessionError) {
        warn!(kind = %error.kind, "provisioning failed: {}", error.message);
        self.transition(SessionState::Error(error.kind.clone()));
        self.last_error = Some(error);
        self.release(false).await;
    }

    async fn finish_cancelled(&mut self) {
        info!(state = %self.state, "session cancelled");
        // tell the toy to drop any half-received frame
        let abort = self.capabilities.is_some();
        self.transition(SessionState::Cancelled);
        self.release(abort).await;
    }

    /// Stop this session's scan. A scan started later by another session is left running.
    async fn stop_scan(&mut self) {
        if let Some(mut scan) = self.scan.take() {
            scan.stop().await;
        }
    }

    /// Stop scanning, drop the link and zero the credential
    async fn release(&mut self, abort: bool) {
        self.stop_scan().await;
        if let Some(bound) = self.bound.take() {
            if abort {
                let aborting = bound.link().write(CONTROL_CHAR_UUID, &[commands::ABORT]);
                match tokio::time::timeout(self.ctx.config.provision_timeout(), aborting).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("abort command not delivered: {e}"),
                    Err(_) => debug!("abort command timed out"),
                }
            }
            // a stalled disconnect still drops the session and frees the connector
            let disconnecting = self.ctx.connector.disconnect(bound);
            match tokio::time::timeout(self.ctx.config.connect_timeout(), disconnecting).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("disconnect failed: {e}"),
                Err(_) => warn!("disconnect timed out"),
            }
        }
        self.credential = None;
        self.awaiting_credential = false;
    }
}
