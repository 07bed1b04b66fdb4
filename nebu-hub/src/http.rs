use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::store::OwnershipStore;

pub type HttpResult<E = std::io::Error> = Result<HttpResponse, E>;

pub type HttpResponse =
    hyper::Response<http_body_util::combinators::BoxBody<hyper::body::Bytes, std::io::Error>>;

pub async fn run_server(addr: SocketAddr, store: Arc<OwnershipStore>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    serve(listener, store).await
}

/// Accept connections on an already bound listener until the task is dropped
pub async fn serve(listener: tokio::net::TcpListener, store: Arc<OwnershipStore>) -> std::io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                tokio::task::spawn(handle_connection(stream, store.clone()));
            }
            Err(e) => {
                warn!("failed to accept: {e:?}");
                continue;
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, store: Arc<OwnershipStore>) {
    let io = hyper_util::rt::TokioIo::new(stream);

    // http1.1 that upgrades to http2 if the client asks
    let builder =
        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::tokio::TokioExecutor::new());
    let conn = builder.serve_connection(
        io,
        hyper::service::service_fn(|r| crate::devices::route(r, store.clone())),
    );

    if let Err(e) = conn.await {
        warn!("connection error: {e:?}");
    }
}

pub fn json<T: serde::Serialize>(o: T) -> HttpResult {
    json_with_status(o, hyper::StatusCode::OK)
}

pub fn json_with_status<T: serde::Serialize>(o: T, status: hyper::StatusCode) -> HttpResult {
    let bytes = match serde_json::to_vec(&o) {
        Ok(v) => v,
        Err(e) => return nebu_hub::server_error!("failed to serialize json: {e:?}"),
    };
    let mut r = bytes_to_resp(bytes, status)?;
    r.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(r)
}

/// Read and decode a JSON request body
pub async fn read_json<T: serde::de::DeserializeOwned>(
    r: hyper::Request<hyper::body::Incoming>,
) -> Result<T, String> {
    let body = match http_body_util::BodyExt::collect(r.into_body()).await {
        Ok(body) => body.to_bytes(),
        Err(e) => return Err(format!("failed to read body: {e}")),
    };
    serde_json::from_slice(&body).map_err(|e| format!("invalid json body: {e}"))
}

pub fn server_error_(s: String) -> HttpResult {
    bytes_to_resp(s.into_bytes(), hyper::StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn bytes_to_resp(bytes: Vec<u8>, status: hyper::StatusCode) -> HttpResult {
    use http_body_util::BodyExt;

    let mut r = hyper::Response::new(
        http_body_util::Full::new(hyper::body::Bytes::from(bytes))
            .map_err(|e| match e {})
            .boxed(),
    );
    *r.status_mut() = status;
    Ok(r)
}

pub fn not_found_(m: String) -> HttpResult {
    bytes_to_resp(m.into_bytes(), hyper::StatusCode::NOT_FOUND)
}

pub fn bad_request_(m: String) -> HttpResult {
    bytes_to_resp(m.into_bytes(), hyper::StatusCode::BAD_REQUEST)
}

pub fn method_not_allowed_(m: String) -> HttpResult {
    bytes_to_resp(m.into_bytes(), hyper::StatusCode::METHOD_NOT_ALLOWED)
}

#[macro_export]
macro_rules! server_error {
    ($($t:tt)*) => {{
        nebu_hub::http::server_error_(format!($($t)*))
    }};
}

#[macro_export]
macro_rules! not_found {
    ($($t:tt)*) => {{
        nebu_hub::http::not_found_(format!($($t)*))
    }};
}

#[macro_export]
macro_rules! bad_request {
    ($($t:tt)*) => {{
        nebu_hub::http::bad_request_(format!($($t)*))
    }};
}

#[macro_export]
macro_rules! method_not_allowed {
    ($($t:tt)*) => {{
        nebu_hub::http::method_not_allowed_(format!($($t)*))
    }};
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    #[test]
    fn json_sets_content_type() {
        let r = super::json(serde_json::json!({"ok": true})).unwrap();
        assert_eq!(r.status(), hyper::StatusCode::OK);
        assert_eq!(r.headers()[hyper::header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn unserializable_body_is_server_error() {
        // json object keys must be strings
        let body = BTreeMap::from([((1u8, 2u8), "pair")]);
        let r = super::json_with_status(body, hyper::StatusCode::CREATED).unwrap();
        assert_eq!(r.status(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
