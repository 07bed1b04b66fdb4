//! Ownership API routes

use std::sync::Arc;

use hyper::{Method, StatusCode};
use nebu_proto::api::{OwnershipRequest, OwnershipResponse, StatusUpdate, ValidateRequest};
use tracing::info;

use crate::http::{HttpResult, json, json_with_status, read_json};
use crate::store::{OwnershipStore, StoreError};

pub async fn route(r: hyper::Request<hyper::body::Incoming>, store: Arc<OwnershipStore>) -> HttpResult {
    let path = r.uri().path().to_string();
    match (r.method().clone(), path.as_str()) {
        (Method::POST, "/devices/validate") => validate(r, &store).await,
        (Method::POST, "/devices/register") => register(r, &store).await,
        (Method::POST, "/devices/unregister") => unregister(r, &store).await,
        (method, p) => match status_path(p) {
            Some(id) if method == Method::PATCH => update_status(r, &store, id).await,
            Some(_) => nebu_hub::method_not_allowed!("{method} not allowed on {p}"),
            None => nebu_hub::not_found!("not found: {p}"),
        },
    }
}

/// `/devices/{id}/status`
fn status_path(path: &str) -> Option<&str> {
    path.strip_prefix("/devices/")?
        .strip_suffix("/status")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

async fn validate(r: hyper::Request<hyper::body::Incoming>, store: &OwnershipStore) -> HttpResult {
    let request: ValidateRequest = match read_json(r).await {
        Ok(v) => v,
        Err(e) => return nebu_hub::bad_request!("{e}"),
    };
    json(store.validate(&request.device_id))
}

fn ownership_error(e: StoreError) -> HttpResult {
    let status = match e {
        StoreError::OwnedByOther => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    json_with_status(OwnershipResponse::err(e.to_string()), status)
}

async fn register(r: hyper::Request<hyper::body::Incoming>, store: &OwnershipStore) -> HttpResult {
    let request: OwnershipRequest = match read_json(r).await {
        Ok(v) => v,
        Err(e) => return nebu_hub::bad_request!("{e}"),
    };
    match store.register(&request.device_id, &request.user_id) {
        Ok(record) => {
            info!(device_id = %record.device_id, user_id = %request.user_id, "device registered");
            json(OwnershipResponse::ok(record))
        }
        Err(e) => ownership_error(e),
    }
}

async fn unregister(r: hyper::Request<hyper::body::Incoming>, store: &OwnershipStore) -> HttpResult {
    let request: OwnershipRequest = match read_json(r).await {
        Ok(v) => v,
        Err(e) => return nebu_hub::bad_request!("{e}"),
    };
    match store.unregister(&request.device_id, &request.user_id) {
        Ok(device) => {
            info!(device_id = %request.device_id, "device unregistered");
            json(OwnershipResponse { success: true, device, error: None })
        }
        Err(e) => ownership_error(e),
    }
}

async fn update_status(
    r: hyper::Request<hyper::body::Incoming>,
    store: &OwnershipStore,
    device_id: &str,
) -> HttpResult {
    let device_id = device_id.to_string();
    let update: StatusUpdate = match read_json(r).await {
        Ok(v) => v,
        Err(e) => return nebu_hub::bad_request!("{e}"),
    };
    match store.update_status(&device_id, &update) {
        Ok(record) => json(record),
        Err(e @ StoreError::UnknownDevice(_)) => nebu_hub::not_found!("{e}"),
        Err(e) => nebu_hub::bad_request!("{e}"),
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn status_path() {
        assert_eq!(super::status_path("/devices/NEBU-Robot-001/status"), Some("NEBU-Robot-001"));
        assert_eq!(super::status_path("/devices//status"), None);
        assert_eq!(super::status_path("/devices/a/b/status"), None);
        assert_eq!(super::status_path("/devices/register"), None);
    }
}
