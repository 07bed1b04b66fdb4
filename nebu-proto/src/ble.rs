//! BLE GATT Service Protocol Constants for NEBU Toy Provisioning
//!
//! A provisionable toy exposes four primary services, one characteristic
//! each. The host refuses to send credentials unless all four are present.

use uuid::Uuid;

/// Device info service (read): JSON document describing the toy
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e650001_7a1c_4b8e_9d2f_000000000000);
pub const DEVICE_INFO_CHAR_UUID: Uuid = Uuid::from_u128(0x6e650001_7a1c_4b8e_9d2f_000000000001);

/// WiFi config service (write): receives chunked credential frames
pub const WIFI_CONFIG_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e650002_7a1c_4b8e_9d2f_000000000000);
pub const WIFI_CONFIG_CHAR_UUID: Uuid = Uuid::from_u128(0x6e650002_7a1c_4b8e_9d2f_000000000001);

/// Control service (write): single command bytes, see [`commands`]
pub const CONTROL_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e650003_7a1c_4b8e_9d2f_000000000000);
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x6e650003_7a1c_4b8e_9d2f_000000000001);

/// Status service (notify): acknowledgements, see [`crate::Ack`]
pub const STATUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e650004_7a1c_4b8e_9d2f_000000000000);
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x6e650004_7a1c_4b8e_9d2f_000000000001);

/// Minimum ATT write payload (default MTU 23 minus the 3 byte ATT header)
pub const MIN_ATT_PAYLOAD: usize = 20;

/// Control command bytes
pub mod commands {
    /// Reset toy - clears stored WiFi and ownership state
    pub const RESET: u8 = 0x01;

    /// Abort - discard a partially received credential frame
    pub const ABORT: u8 = 0x02;
}

/// One of the four protocol surfaces a toy must expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Surface {
    DeviceInfo,
    WifiConfig,
    Control,
    Status,
}

impl Surface {
    pub const ALL: [Surface; 4] = [
        Surface::DeviceInfo,
        Surface::WifiConfig,
        Surface::Control,
        Surface::Status,
    ];

    /// Stable identifier used in diagnostics, e.g. `"wifi-config"`
    pub fn id(&self) -> &'static str {
        match self {
            Surface::DeviceInfo => "device-info",
            Surface::WifiConfig => "wifi-config",
            Surface::Control => "control",
            Surface::Status => "status",
        }
    }

    pub fn service_uuid(&self) -> Uuid {
        match self {
            Surface::DeviceInfo => DEVICE_INFO_SERVICE_UUID,
            Surface::WifiConfig => WIFI_CONFIG_SERVICE_UUID,
            Surface::Control => CONTROL_SERVICE_UUID,
            Surface::Status => STATUS_SERVICE_UUID,
        }
    }

    pub fn characteristic_uuid(&self) -> Uuid {
        match self {
            Surface::DeviceInfo => DEVICE_INFO_CHAR_UUID,
            Surface::WifiConfig => WIFI_CONFIG_CHAR_UUID,
            Surface::Control => CONTROL_CHAR_UUID,
            Surface::Status => STATUS_CHAR_UUID,
        }
    }
}

impl std::fmt::Display for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_ids_are_stable() {
        let ids: Vec<_> = Surface::ALL.iter().map(|s| s.id()).collect();
        assert_eq!(ids, ["device-info", "wifi-config", "control", "status"]);
        assert_eq!(
            serde_json::to_string(&Surface::WifiConfig).unwrap(),
            "\"wifi-config\""
        );
    }

    #[test]
    fn characteristics_differ_from_their_services() {
        for surface in Surface::ALL {
            assert_ne!(surface.service_uuid(), surface.characteristic_uuid());
        }
    }
}
