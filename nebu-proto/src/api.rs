//! Backend ownership API wire types
//!
//! Shared by the registrar client in `nebu-pairing` and the reference
//! server in `nebu-hub`. All bodies are JSON with camelCase keys.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an owned device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Inactive,
    Active,
    Connected,
    Disconnected,
    Maintenance,
    Error,
    Blocked,
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "maintenance" => Ok(Self::Maintenance),
            "error" => Ok(Self::Error),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

/// Backend record binding a device identity to a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipRecord {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i16>,
    #[serde(default)]
    pub registered_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// `POST /devices/validate`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub is_valid: bool,
    #[serde(default)]
    pub requires_update: bool,
}

/// `POST /devices/register` and `POST /devices/unregister`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipRequest {
    pub device_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<OwnershipRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OwnershipResponse {
    pub fn ok(device: OwnershipRecord) -> Self {
        Self { success: true, device: Some(device), error: None }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self { success: false, device: None, error: Some(msg.into()) }
    }
}

/// `PATCH /devices/{id}/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_wire_names() {
        let body = serde_json::to_value(OwnershipRequest {
            device_id: "NEBU-Robot-001".to_string(),
            user_id: "user-1".to_string(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"deviceId": "NEBU-Robot-001", "userId": "user-1"}));

        let resp: ValidateResponse =
            serde_json::from_str(r#"{"isValid": true, "requiresUpdate": false}"#).unwrap();
        assert!(resp.is_valid);
    }

    #[test]
    fn status_update_omits_missing_readings() {
        let body = serde_json::to_value(StatusUpdate {
            status: DeviceStatus::Connected,
            battery_level: None,
            signal_strength: Some(-60),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"status": "connected", "signalStrength": -60}));
    }

    #[test]
    fn status_parses_from_cli_text() {
        assert_eq!("maintenance".parse::<DeviceStatus>().unwrap(), DeviceStatus::Maintenance);
        assert!("online".parse::<DeviceStatus>().is_err());
    }
}
