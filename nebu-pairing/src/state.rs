//! Session states and the error taxonomy shown to the UI

use std::collections::BTreeSet;
use std::fmt;

use nebu_ble_controller::{ConnectError, ProvisionError, RadioError, ScanError, VerifyError};
use nebu_proto::ble::Surface;
use serde::Serialize;

use crate::registrar::RegistrarError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Scanning,
    DeviceSelected,
    Connecting,
    CapabilityCheck,
    Provisioning,
    BackendValidating,
    Complete,
    Error(ErrorKind),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error(_) | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::DeviceSelected => write!(f, "device-selected"),
            Self::Connecting => write!(f, "connecting"),
            Self::CapabilityCheck => write!(f, "capability-check"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::BackendValidating => write!(f, "backend-validating"),
            Self::Complete => write!(f, "complete"),
            Self::Error(kind) => write!(f, "error({kind})"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why the toy did not accept the credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProvisionFailure {
    Timeout,
    BadCredentials,
    DeviceRejected,
}

/// Every failure a session can end in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ErrorKind {
    RadioUnavailable,
    PermissionDenied,
    ConnectTimeout,
    ConnectFailed,
    Unsupported { missing: BTreeSet<Surface> },
    ProvisionFailed { reason: ProvisionFailure },
    RegistrationFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RadioUnavailable => write!(f, "radio-unavailable"),
            Self::PermissionDenied => write!(f, "permission-denied"),
            Self::ConnectTimeout => write!(f, "connect-timeout"),
            Self::ConnectFailed => write!(f, "connect-failed"),
            Self::Unsupported { missing } => {
                let ids: Vec<_> = missing.iter().map(|s| s.id()).collect();
                write!(f, "unsupported[{}]", ids.join(","))
            }
            Self::ProvisionFailed { reason } => write!(f, "provision-failed({reason:?})"),
            Self::RegistrationFailed => write!(f, "registration-failed"),
        }
    }
}

/// Last failure of a session: taxonomy member plus a readable message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl From<ScanError> for SessionError {
    fn from(e: ScanError) -> Self {
        let kind = match e {
            ScanError::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::RadioUnavailable,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<ConnectError> for SessionError {
    fn from(e: ConnectError) -> Self {
        let kind = match e {
            ConnectError::Timeout(_) => ErrorKind::ConnectTimeout,
            ConnectError::Failed(RadioError::PermissionDenied) => ErrorKind::PermissionDenied,
            ConnectError::Failed(RadioError::Unavailable(_)) => ErrorKind::RadioUnavailable,
            _ => ErrorKind::ConnectFailed,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<VerifyError> for SessionError {
    fn from(e: VerifyError) -> Self {
        let message = e.to_string();
        match e {
            VerifyError::Mismatch { missing } => Self::new(ErrorKind::Unsupported { missing }, message),
            // link lost while reading the GATT table
            VerifyError::Radio(_) => Self::new(ErrorKind::ConnectFailed, message),
        }
    }
}

impl From<ProvisionError> for SessionError {
    fn from(e: ProvisionError) -> Self {
        let reason = match e {
            ProvisionError::Timeout { .. } => ProvisionFailure::Timeout,
            ProvisionError::BadCredentials { .. } => ProvisionFailure::BadCredentials,
            ProvisionError::DeviceRejected { .. } | ProvisionError::Encode(_) | ProvisionError::Cancelled => {
                ProvisionFailure::DeviceRejected
            }
        };
        Self::new(ErrorKind::ProvisionFailed { reason }, e.to_string())
    }
}

impl From<RegistrarError> for SessionError {
    fn from(e: RegistrarError) -> Self {
        Self::new(ErrorKind::RegistrationFailed, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_state_serializes_tagged() {
        let state = SessionState::Error(ErrorKind::Unsupported { missing: BTreeSet::from([Surface::WifiConfig]) });
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            serde_json::json!({"state": "error", "error": {"kind": "unsupported", "missing": ["wifi-config"]}})
        );
        assert_eq!(serde_json::to_value(SessionState::Idle).unwrap(), serde_json::json!({"state": "idle"}));

        let kind = ErrorKind::ProvisionFailed { reason: ProvisionFailure::BadCredentials };
        assert_eq!(
            serde_json::to_value(kind).unwrap(),
            serde_json::json!({"kind": "provisionFailed", "reason": "badCredentials"})
        );
    }

    #[test]
    fn failures_map_to_one_kind() {
        assert_eq!(SessionError::from(ScanError::PermissionDenied).kind, ErrorKind::PermissionDenied);
        assert_eq!(
            SessionError::from(ConnectError::Timeout(std::time::Duration::from_secs(1))).kind,
            ErrorKind::ConnectTimeout
        );
        assert_eq!(SessionError::from(ConnectError::InFlight).kind, ErrorKind::ConnectFailed);
        assert_eq!(
            SessionError::from(ProvisionError::Timeout { attempts: 3 }).kind,
            ErrorKind::ProvisionFailed { reason: ProvisionFailure::Timeout }
        );
        let e = SessionError::from(RegistrarError::Timeout(std::time::Duration::from_secs(10)));
        assert_eq!(e.kind, ErrorKind::RegistrationFailed);
        assert_eq!(e.to_string(), "registration-failed: backend did not answer within 10s");
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Complete.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(SessionState::Error(ErrorKind::ConnectFailed).is_terminal());
        assert!(!SessionState::CapabilityCheck.is_terminal());
    }
}
