//! In-memory ownership records

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use nebu_proto::api::{DeviceStatus, OwnershipRecord, StatusUpdate, ValidateResponse};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid device id: {0:?}")]
    InvalidDevice(String),
    #[error("invalid user id")]
    InvalidUser,
    #[error("device {0} is blocked")]
    Blocked(String),
    #[error("device owned by another user")]
    OwnedByOther,
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("battery level {0} out of range 0-100")]
    InvalidBattery(u8),
}

/// 1-64 ASCII alphanumerics, `-`, `_` or `:`
pub fn is_valid_device_id(id: &str) -> bool {
    (1..=64).contains(&id.len())
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b':'))
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct OwnershipStore {
    records: Mutex<HashMap<String, OwnershipRecord>>,
}

impl OwnershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, OwnershipRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, device_id: &str) -> Option<OwnershipRecord> {
        self.records().get(device_id).cloned()
    }

    /// Add or replace a record, e.g. to mark a device blocked
    pub fn insert(&self, record: OwnershipRecord) {
        self.records().insert(record.device_id.clone(), record);
    }

    pub fn validate(&self, device_id: &str) -> ValidateResponse {
        let status = self.records().get(device_id).map(|r| r.status);
        ValidateResponse {
            is_valid: is_valid_device_id(device_id) && status != Some(DeviceStatus::Blocked),
            requires_update: status == Some(DeviceStatus::Maintenance),
        }
    }

    /// Bind `device_id` to `user_id`. Repeating the call returns the same record.
    pub fn register(&self, device_id: &str, user_id: &str) -> Result<OwnershipRecord, StoreError> {
        if !is_valid_device_id(device_id) {
            return Err(StoreError::InvalidDevice(device_id.to_string()));
        }
        if user_id.is_empty() {
            return Err(StoreError::InvalidUser);
        }

        let mut records = self.records();
        let now = now();
        let record = records.entry(device_id.to_string()).or_insert_with(|| OwnershipRecord {
            device_id: device_id.to_string(),
            user_id: None,
            status: DeviceStatus::Inactive,
            battery_level: None,
            signal_strength: None,
            registered_at: now,
            updated_at: now,
        });

        match record.user_id.as_deref() {
            _ if record.status == DeviceStatus::Blocked => Err(StoreError::Blocked(device_id.to_string())),
            Some(owner) if owner == user_id => Ok(record.clone()),
            Some(_) => Err(StoreError::OwnedByOther),
            None => {
                record.user_id = Some(user_id.to_string());
                record.status = DeviceStatus::Active;
                record.registered_at = now;
                record.updated_at = now;
                Ok(record.clone())
            }
        }
    }

    /// Release `device_id`. Only the owner may do so; an unowned device is a no-op.
    pub fn unregister(&self, device_id: &str, user_id: &str) -> Result<Option<OwnershipRecord>, StoreError> {
        let mut records = self.records();
        let Some(record) = records.get_mut(device_id) else {
            return Ok(None);
        };

        match record.user_id.as_deref() {
            None => Ok(Some(record.clone())),
            Some(owner) if owner != user_id => Err(StoreError::OwnedByOther),
            Some(_) => {
                record.user_id = None;
                if record.status != DeviceStatus::Blocked {
                    record.status = DeviceStatus::Inactive;
                }
                record.updated_at = now();
                Ok(Some(record.clone()))
            }
        }
    }

    pub fn update_status(&self, device_id: &str, update: &StatusUpdate) -> Result<OwnershipRecord, StoreError> {
        if let Some(battery) = update.battery_level.filter(|b| *b > 100) {
            return Err(StoreError::InvalidBattery(battery));
        }

        let mut records = self.records();
        let record = records
            .get_mut(device_id)
            .ok_or_else(|| StoreError::UnknownDevice(device_id.to_string()))?;
        record.status = update.status;
        if update.battery_level.is_some() {
            record.battery_level = update.battery_level;
        }
        if update.signal_strength.is_some() {
            record.signal_strength = update.signal_strength;
        }
        record.updated_at = now();
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(id: &str) -> OwnershipRecord {
        OwnershipRecord {
            device_id: id.to_string(),
            user_id: None,
            status: DeviceStatus::Blocked,
            battery_level: None,
            signal_strength: None,
            registered_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn device_id_rules() {
        assert!(is_valid_device_id("NEBU-Robot-001"));
        assert!(is_valid_device_id("aa:bb:cc:dd:ee:ff"));
        assert!(!is_valid_device_id(""));
        assert!(!is_valid_device_id("has space"));
        assert!(!is_valid_device_id(&"x".repeat(65)));
    }

    #[test]
    fn register_is_idempotent() {
        let store = OwnershipStore::new();
        let first = store.register("NEBU-Robot-001", "user-1").unwrap();
        let second = store.register("NEBU-Robot-001", "user-1").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.status, DeviceStatus::Active);
        assert_eq!(store.register("NEBU-Robot-001", "user-2"), Err(StoreError::OwnedByOther));
    }

    #[test]
    fn unregister_only_by_owner() {
        let store = OwnershipStore::new();
        assert_eq!(store.unregister("NEBU-Robot-001", "user-1"), Ok(None));

        store.register("NEBU-Robot-001", "user-1").unwrap();
        assert_eq!(store.unregister("NEBU-Robot-001", "user-2"), Err(StoreError::OwnedByOther));

        let released = store.unregister("NEBU-Robot-001", "user-1").unwrap().unwrap();
        assert_eq!(released.user_id, None);
        assert_eq!(released.status, DeviceStatus::Inactive);
        // repeatable
        assert!(store.unregister("NEBU-Robot-001", "user-1").is_ok());
        assert!(store.register("NEBU-Robot-001", "user-2").is_ok());
    }

    #[test]
    fn blocked_and_maintenance_devices() {
        let store = OwnershipStore::new();
        store.insert(blocked("NEBU-Robot-666"));
        assert!(!store.validate("NEBU-Robot-666").is_valid);
        assert_eq!(
            store.register("NEBU-Robot-666", "user-1"),
            Err(StoreError::Blocked("NEBU-Robot-666".to_string()))
        );

        store.register("NEBU-Robot-001", "user-1").unwrap();
        let update = StatusUpdate { status: DeviceStatus::Maintenance, battery_level: Some(80), signal_strength: None };
        store.update_status("NEBU-Robot-001", &update).unwrap();
        assert_eq!(
            store.validate("NEBU-Robot-001"),
            ValidateResponse { is_valid: true, requires_update: true }
        );
    }

    #[test]
    fn status_update_checks() {
        let store = OwnershipStore::new();
        let update = StatusUpdate { status: DeviceStatus::Connected, battery_level: Some(101), signal_strength: None };
        assert_eq!(store.update_status("NEBU-Robot-001", &update), Err(StoreError::InvalidBattery(101)));

        let update = StatusUpdate { status: DeviceStatus::Connected, battery_level: Some(55), signal_strength: Some(-60) };
        assert_eq!(
            store.update_status("NEBU-Robot-001", &update),
            Err(StoreError::UnknownDevice("NEBU-Robot-001".to_string()))
        );

        store.register("NEBU-Robot-001", "user-1").unwrap();
        let record = store.update_status("NEBU-Robot-001", &update).unwrap();
        assert_eq!(record.battery_level, Some(55));
        assert_eq!(record.signal_strength, Some(-60));
        assert_eq!(record.status, DeviceStatus::Connected);
    }
}
