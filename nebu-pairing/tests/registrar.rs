use std::sync::Arc;
use std::time::Duration;

use nebu_pairing::{HttpRegistrar, OwnershipApi, RegistrarError};
use nebu_proto::api::{DeviceStatus, OwnershipRecord, StatusUpdate};

async fn start_hub() -> (String, Arc<nebu_hub::OwnershipStore>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store = Arc::new(nebu_hub::OwnershipStore::new());
    tokio::spawn(nebu_hub::serve(listener, store.clone()));
    (format!("http://{addr}"), store)
}

fn registrar(url: &str) -> HttpRegistrar {
    HttpRegistrar::new(url, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn validate_then_register_is_idempotent() {
    let (url, _store) = start_hub().await;
    let registrar = registrar(&url);

    let validation = registrar.validate("NEBU-Robot-001").await.unwrap();
    assert!(validation.is_valid);
    assert!(!validation.requires_update);

    let first = registrar.register("NEBU-Robot-001", "user-1").await.unwrap();
    let second = registrar.register("NEBU-Robot-001", "user-1").await.unwrap();
    assert!(first.success && second.success);
    assert_eq!(first.device, second.device);
    assert_eq!(first.device.unwrap().user_id.as_deref(), Some("user-1"));
}

#[tokio::test]
async fn conflicting_owner_gets_success_false() {
    let (url, _store) = start_hub().await;
    let registrar = registrar(&url);

    registrar.register("NEBU-Robot-001", "user-1").await.unwrap();
    let conflict = registrar.register("NEBU-Robot-001", "user-2").await.unwrap();
    assert!(!conflict.success);
    assert_eq!(conflict.error.as_deref(), Some("device owned by another user"));

    let refused = registrar.unregister("NEBU-Robot-001", "user-2").await.unwrap();
    assert!(!refused.success);

    let released = registrar.unregister("NEBU-Robot-001", "user-1").await.unwrap();
    assert!(released.success);
    assert!(registrar.register("NEBU-Robot-001", "user-2").await.unwrap().success);
}

#[tokio::test]
async fn blocked_and_malformed_ids_are_invalid() {
    let (url, store) = start_hub().await;
    store.insert(OwnershipRecord {
        device_id: "NEBU-Robot-666".to_string(),
        user_id: None,
        status: DeviceStatus::Blocked,
        battery_level: None,
        signal_strength: None,
        registered_at: 0,
        updated_at: 0,
    });
    let registrar = registrar(&url);

    assert!(!registrar.validate("NEBU-Robot-666").await.unwrap().is_valid);
    assert!(!registrar.validate("bad id").await.unwrap().is_valid);
    assert!(!registrar.register("NEBU-Robot-666", "user-1").await.unwrap().success);
}

#[tokio::test]
async fn status_updates() {
    let (url, _store) = start_hub().await;
    let registrar = registrar(&url);
    let update = StatusUpdate { status: DeviceStatus::Connected, battery_level: Some(76), signal_strength: Some(-58) };

    let err = registrar.update_status("NEBU-Robot-001", &update).await.unwrap_err();
    assert!(matches!(err, RegistrarError::Rejected { status: 404, .. }));

    registrar.register("NEBU-Robot-001", "user-1").await.unwrap();
    let record = registrar.update_status("NEBU-Robot-001", &update).await.unwrap();
    assert_eq!(record.status, DeviceStatus::Connected);
    assert_eq!(record.battery_level, Some(76));

    let too_full = StatusUpdate { battery_level: Some(150), ..update };
    let err = registrar.update_status("NEBU-Robot-001", &too_full).await.unwrap_err();
    assert!(matches!(err, RegistrarError::Rejected { status: 400, .. }));
}

#[tokio::test]
async fn unreachable_backend_is_transport_error() {
    // bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = registrar(&format!("http://{addr}")).validate("NEBU-Robot-001").await.unwrap_err();
    assert!(matches!(err, RegistrarError::Transport(_)));
}
