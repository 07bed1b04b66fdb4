use std::collections::BTreeSet;
use std::time::Duration;

use nebu_proto::ble::Surface;
use uuid::Uuid;

/// Failure reported by the platform radio stack
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("bluetooth radio unavailable: {0}")]
    Unavailable(String),
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("peripheral not found: {0}")]
    NotFound(String),
    #[error("peripheral not connected")]
    NotConnected,
    #[error("characteristic {0} not found")]
    NoSuchCharacteristic(Uuid),
    #[error("radio transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("bluetooth radio unavailable: {0}")]
    RadioUnavailable(String),
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("scan filter must name at least one prefix or service")]
    InvalidFilter,
    #[error("scan duration must be positive")]
    InvalidDuration,
}

impl From<RadioError> for ScanError {
    fn from(e: RadioError) -> Self {
        match e {
            RadioError::PermissionDenied => ScanError::PermissionDenied,
            RadioError::Unavailable(m) => ScanError::RadioUnavailable(m),
            other => ScanError::RadioUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("a peripheral is already bound, disconnect it first")]
    AlreadyBound,
    #[error("another connect attempt is in flight")]
    InFlight,
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Failed(RadioError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("missing capabilities: {}", display_surfaces(missing))]
    Mismatch { missing: BTreeSet<Surface> },
    #[error(transparent)]
    Radio(#[from] RadioError),
}

fn display_surfaces(surfaces: &BTreeSet<Surface>) -> String {
    surfaces.iter().map(|s| s.id()).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("no acknowledgement after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("peripheral rejected the WiFi credentials")]
    BadCredentials { attempts: u32 },
    #[error("peripheral does not support this credential frame")]
    DeviceRejected { attempts: u32 },
    #[error("provisioning cancelled")]
    Cancelled,
    #[error("failed to encode credential frame: {0}")]
    Encode(String),
}

impl ProvisionError {
    /// Frames sent before the provisioner gave up
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ProvisionError::Timeout { attempts }
            | ProvisionError::BadCredentials { attempts }
            | ProvisionError::DeviceRejected { attempts } => Some(*attempts),
            ProvisionError::Cancelled | ProvisionError::Encode(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid WiFi credential: {0}")]
    Invalid(&'static str),
}
