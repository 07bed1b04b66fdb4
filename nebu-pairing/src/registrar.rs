//! Ownership Registrar - binds provisioned toys to user accounts on the backend

use std::future::Future;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use nebu_proto::api::{
    OwnershipRecord, OwnershipRequest, OwnershipResponse, StatusUpdate, ValidateRequest, ValidateResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrarError {
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
    #[error("backend unreachable: {0}")]
    Transport(String),
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("failed to decode backend response: {0}")]
    Decode(String),
}

/// Backend ownership operations
///
/// `register` and `unregister` are idempotent on the backend: repeating a
/// call with the same arguments leaves the same record.
pub trait OwnershipApi: Send + Sync + 'static {
    fn validate(&self, device_id: &str) -> impl Future<Output = Result<ValidateResponse, RegistrarError>> + Send;

    fn register(
        &self,
        device_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<OwnershipResponse, RegistrarError>> + Send;

    fn unregister(
        &self,
        device_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<OwnershipResponse, RegistrarError>> + Send;

    fn update_status(
        &self,
        device_id: &str,
        update: &StatusUpdate,
    ) -> impl Future<Output = Result<OwnershipRecord, RegistrarError>> + Send;
}

/// JSON-over-HTTP client for the ownership API
#[derive(Clone)]
pub struct HttpRegistrar {
    base: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpRegistrar {
    /// `base_url` like `http://127.0.0.1:9000`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RegistrarError> {
        let base = base_url.trim_end_matches('/').to_string();
        let uri: hyper::Uri = base.parse().map_err(|_| RegistrarError::InvalidUrl(base_url.to_string()))?;
        if uri.scheme_str() != Some("http") || uri.host().is_none() {
            return Err(RegistrarError::InvalidUrl(base_url.to_string()));
        }

        Ok(Self {
            base,
            timeout,
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, RegistrarError> {
        let url = format!("{}{path}", self.base);
        let body = serde_json::to_vec(body).map_err(|e| RegistrarError::Decode(e.to_string()))?;
        let request = hyper::Request::builder()
            .method(method.clone())
            .uri(&url)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RegistrarError::InvalidUrl(e.to_string()))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| RegistrarError::Transport(e.to_string()))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| RegistrarError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, RegistrarError>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| RegistrarError::Timeout(self.timeout))??;
        debug!(%method, %url, status = status.as_u16(), "backend call");

        decode(status, &bytes)
    }
}

/// Non-2xx bodies are still decoded when they carry the expected document,
/// e.g. a `409 {"success": false}` from register
fn decode<T: DeserializeOwned>(status: StatusCode, bytes: &[u8]) -> Result<T, RegistrarError> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(e) if status.is_success() => Err(RegistrarError::Decode(e.to_string())),
        Err(_) => {
            let message = String::from_utf8_lossy(bytes).trim().to_string();
            warn!(status = status.as_u16(), %message, "backend rejected request");
            Err(RegistrarError::Rejected { status: status.as_u16(), message })
        }
    }
}

impl OwnershipApi for HttpRegistrar {
    async fn validate(&self, device_id: &str) -> Result<ValidateResponse, RegistrarError> {
        let request = ValidateRequest { device_id: device_id.to_string() };
        self.call(Method::POST, "/devices/validate", &request).await
    }

    async fn register(&self, device_id: &str, user_id: &str) -> Result<OwnershipResponse, RegistrarError> {
        let request = OwnershipRequest { device_id: device_id.to_string(), user_id: user_id.to_string() };
        self.call(Method::POST, "/devices/register", &request).await
    }

    async fn unregister(&self, device_id: &str, user_id: &str) -> Result<OwnershipResponse, RegistrarError> {
        let request = OwnershipRequest { device_id: device_id.to_string(), user_id: user_id.to_string() };
        self.call(Method::POST, "/devices/unregister", &request).await
    }

    async fn update_status(&self, device_id: &str, update: &StatusUpdate) -> Result<OwnershipRecord, RegistrarError> {
        self.call(Method::PATCH, &format!("/devices/{device_id}/status"), update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        let timeout = Duration::from_secs(1);
        assert!(HttpRegistrar::new("http://127.0.0.1:9000/", timeout).is_ok());
        assert!(matches!(
            HttpRegistrar::new("ftp://example.com", timeout),
            Err(RegistrarError::InvalidUrl(_))
        ));
        assert!(matches!(HttpRegistrar::new("not a url", timeout), Err(RegistrarError::InvalidUrl(_))));
    }

    #[test]
    fn conflict_body_is_decoded() {
        let body = br#"{"success": false, "error": "device owned by another user"}"#;
        let response: OwnershipResponse = decode(StatusCode::CONFLICT, body).unwrap();
        assert!(!response.success);
    }

    #[test]
    fn plain_error_body_is_rejected() {
        let result: Result<OwnershipRecord, _> = decode(StatusCode::NOT_FOUND, b"unknown device: x\n");
        assert_eq!(
            result.unwrap_err(),
            RegistrarError::Rejected { status: 404, message: "unknown device: x".to_string() }
        );

        let result: Result<OwnershipRecord, _> = decode(StatusCode::OK, b"garbage");
        assert!(matches!(result, Err(RegistrarError::Decode(_))));
    }
}
