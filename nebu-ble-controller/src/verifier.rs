//! Capability Verifier - read-only check that a bound toy speaks the protocol

use std::collections::BTreeSet;

use nebu_proto::ble::Surface;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connector::BoundSession;
use crate::radio::{GattService, Link};
use crate::VerifyError;

/// A protocol surface located on the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub surface: Surface,
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// All four required surfaces. Only constructible when every one is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub device_info: Capability,
    pub wifi_config: Capability,
    pub control: Capability,
    pub status: Capability,
}

impl CapabilitySet {
    pub fn get(&self, surface: Surface) -> &Capability {
        match surface {
            Surface::DeviceInfo => &self.device_info,
            Surface::WifiConfig => &self.wifi_config,
            Surface::Control => &self.control,
            Surface::Status => &self.status,
        }
    }
}

/// Identity document served on the device-info characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// Match discovered services against the required surfaces
///
/// A surface counts only if its service exists and carries its characteristic.
pub fn check_surfaces(services: &[GattService]) -> Result<CapabilitySet, BTreeSet<Surface>> {
    let find = |surface: Surface| {
        services
            .iter()
            .filter(|s| s.uuid == surface.service_uuid())
            .any(|s| s.characteristics.contains(&surface.characteristic_uuid()))
            .then(|| Capability {
                surface,
                service: surface.service_uuid(),
                characteristic: surface.characteristic_uuid(),
            })
    };

    match (
        find(Surface::DeviceInfo),
        find(Surface::WifiConfig),
        find(Surface::Control),
        find(Surface::Status),
    ) {
        (Some(device_info), Some(wifi_config), Some(control), Some(status)) => {
            Ok(CapabilitySet { device_info, wifi_config, control, status })
        }
        _ => Err(Surface::ALL.into_iter().filter(|s| find(*s).is_none()).collect()),
    }
}

/// Discover services on the bound toy and require all four surfaces
pub async fn verify<L: Link>(session: &BoundSession<L>) -> Result<CapabilitySet, VerifyError> {
    let services = session.link().discover().await?;
    debug!(peripheral = %session.handle().id, services = services.len(), "services discovered");

    match check_surfaces(&services) {
        Ok(capabilities) => {
            info!(peripheral = %session.handle().id, "all capabilities present");
            Ok(capabilities)
        }
        Err(missing) => {
            let ids: Vec<_> = missing.iter().map(|s| s.id()).collect();
            warn!(peripheral = %session.handle().id, missing = ?ids, "capability mismatch");
            Err(VerifyError::Mismatch { missing })
        }
    }
}

/// Read the toy's identity
///
/// Accepts the JSON document or a bare id string. An empty or unreadable
/// value falls back to the platform peripheral id.
pub async fn read_device_info<L: Link>(
    session: &BoundSession<L>,
    capabilities: &CapabilitySet,
) -> Result<DeviceInfo, VerifyError> {
    let raw = session.link().read(capabilities.device_info.characteristic).await?;

    if let Ok(info) = serde_json::from_slice::<DeviceInfo>(&raw) {
        if !info.device_id.is_empty() {
            return Ok(info);
        }
    }

    let device_id = match std::str::from_utf8(&raw).map(str::trim) {
        Ok(id) if !id.is_empty() && !id.starts_with('{') => id.to_string(),
        _ => {
            warn!(peripheral = %session.handle().id, "device-info unreadable, using peripheral id");
            session.handle().id.clone()
        }
    };
    Ok(DeviceInfo { device_id, model: None, firmware_version: None })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::connector::Connector;
    use crate::testing::{advert, FakePeripheral, FakeRadio, RadioEvent};

    fn all_services() -> Vec<GattService> {
        Surface::ALL
            .iter()
            .map(|s| GattService { uuid: s.service_uuid(), characteristics: vec![s.characteristic_uuid()] })
            .collect()
    }

    #[test]
    fn all_surfaces_present() {
        let caps = check_surfaces(&all_services()).unwrap();
        assert_eq!(caps.get(Surface::Status).characteristic, nebu_proto::ble::STATUS_CHAR_UUID);
    }

    #[test]
    fn reports_exact_missing_subset() {
        let mut services = all_services();
        services.retain(|s| s.uuid != nebu_proto::ble::WIFI_CONFIG_SERVICE_UUID);
        services[0].characteristics.clear(); // device-info service without its characteristic

        let missing = check_surfaces(&services).unwrap_err();
        assert_eq!(missing, BTreeSet::from([Surface::DeviceInfo, Surface::WifiConfig]));
    }

    #[test]
    fn characteristic_under_wrong_service_does_not_count() {
        let mut services = all_services();
        services.retain(|s| s.uuid != nebu_proto::ble::CONTROL_SERVICE_UUID);
        services[0].characteristics.push(nebu_proto::ble::CONTROL_CHAR_UUID);

        assert_eq!(check_surfaces(&services).unwrap_err(), BTreeSet::from([Surface::Control]));
    }

    #[tokio::test]
    async fn verify_is_read_only() {
        let radio = Arc::new(FakeRadio::new());
        radio.add("a", FakePeripheral::toy("NEBU-0001").without(Surface::WifiConfig));
        let connector = Connector::new(radio.clone());
        let session = connector
            .connect(&advert("a", "NEBU-Robot-001", -45).into(), Duration::from_secs(1))
            .await
            .unwrap();

        let err = verify(&session).await.unwrap_err();
        assert_eq!(err, VerifyError::Mismatch { missing: BTreeSet::from([Surface::WifiConfig]) });
        assert_eq!(err.to_string(), "missing capabilities: wifi-config");
        assert!(radio.events().iter().all(|e| !matches!(e, RadioEvent::Write { .. })));
    }

    #[tokio::test]
    async fn device_info_json_and_fallbacks() {
        let radio = Arc::new(FakeRadio::new());
        radio.add("a", FakePeripheral::toy("NEBU-0001"));
        radio.add("b", FakePeripheral::toy("ignored").device_info(b"NEBU-0002\n".to_vec()));
        radio.add("c", FakePeripheral::toy("ignored").device_info(Vec::new()));
        let connector = Connector::new(radio.clone());

        let mut ids = Vec::new();
        for id in ["a", "b", "c"] {
            let session = connector
                .connect(&advert(id, "NEBU-Robot", -45).into(), Duration::from_secs(1))
                .await
                .unwrap();
            let caps = verify(&session).await.unwrap();
            ids.push(read_device_info(&session, &caps).await.unwrap().device_id);
            connector.disconnect(session).await.unwrap();
        }
        assert_eq!(ids, ["NEBU-0001", "NEBU-0002", "c"]);
    }
}
