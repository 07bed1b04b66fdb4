//! NEBU Pairing - provisioning sessions for NEBU toys
//!
//! Ties the BLE controller to the ownership backend: a
//! [`ProvisioningSession`] discovers a toy, binds and verifies it, delivers
//! WiFi credentials and registers the toy to a user.

mod config;
mod registrar;
mod session;
mod state;

pub use config::{ConfigError, PairingConfig, nebu_home};
pub use registrar::{HttpRegistrar, OwnershipApi, RegistrarError};
pub use session::{
    CancelHandle, CommandError, PairingContext, ProvisioningSession, SessionSnapshot, StageAttempts,
};
pub use state::{ErrorKind, ProvisionFailure, SessionError, SessionState};
