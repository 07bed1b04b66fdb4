//! NEBU BLE Controller
//!
//! Central-role BLE client for provisioning NEBU toys: scan, bind a single
//! link, verify the toy's GATT surfaces and deliver WiFi credentials.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nebu_ble_controller::{BtleRadio, Connector, Provisioner, ScanFilter, Scanner, WifiCredential};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let radio = Arc::new(BtleRadio::new().await?);
//!     let scanner = Scanner::new(radio.clone());
//!     let mut scan = scanner.start_scan(ScanFilter::names(["NEBU-"]), None).await?;
//!     let Some(toy) = scan.next().await else { return Ok(()) };
//!     scan.stop().await;
//!
//!     let connector = Connector::new(radio);
//!     let session = connector.connect(&toy, Duration::from_secs(10)).await?;
//!     nebu_ble_controller::verify(&session).await?;
//!
//!     let credential = WifiCredential::new("MySSID", "MyPassword")?;
//!     let cancel = Default::default();
//!     Provisioner::new()
//!         .provision(&session, &credential, Duration::from_secs(10), 2, &cancel)
//!         .await?;
//!     connector.disconnect(session).await?;
//!     Ok(())
//! }
//! ```

mod btle;
mod connector;
mod control;
mod credential;
mod error;
mod provisioner;
pub mod radio;
mod scanner;
mod verifier;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use btle::{BtleLink, BtleRadio};
pub use connector::{BoundSession, Connector};
pub use control::reset;
pub use credential::WifiCredential;
pub use error::{ConnectError, CredentialError, ProvisionError, RadioError, ScanError, VerifyError};
pub use provisioner::{ProvisionOutcome, Provisioner};
pub use radio::{Link, Radio};
pub use scanner::{DEFAULT_SCAN_DURATION, PeripheralHandle, RSSI_HYSTERESIS_DBM, ScanFilter, ScanStream, Scanner};
pub use verifier::{Capability, CapabilitySet, DeviceInfo, check_surfaces, read_device_info, verify};
