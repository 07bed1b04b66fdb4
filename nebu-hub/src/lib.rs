//! NEBU Hub - reference ownership backend
//!
//! Serves the device ownership API over HTTP from an in-memory store. Used
//! for local development and end-to-end tests of the pairing flow.

extern crate self as nebu_hub;

mod devices;
pub mod http;
mod store;

pub use http::{run_server, serve};
pub use store::{OwnershipStore, StoreError, is_valid_device_id};
