//! Pairing configuration - read from NEBU_HOME/config.json

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nebu_ble_controller::ScanFilter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory, set NEBU_HOME")]
    NoHome,
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Get NEBU_HOME directory (defaults to ~/.nebu)
pub fn nebu_home() -> Result<PathBuf, ConfigError> {
    match std::env::var_os("NEBU_HOME") {
        Some(home) => Ok(PathBuf::from(home)),
        None => dirs::home_dir().map(|h| h.join(".nebu")).ok_or(ConfigError::NoHome),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PairingConfig {
    pub name_prefixes: Vec<String>,
    pub service_filter: Vec<Uuid>,
    pub scan_duration_secs: u64,
    pub connect_timeout_ms: u64,
    pub connect_attempts: u32,
    /// Linear backoff unit: the wait after attempt `n` is `n * connect_backoff_ms`
    pub connect_backoff_ms: u64,
    /// Bounds service discovery plus the device-info read
    pub capability_timeout_ms: u64,
    pub provision_timeout_ms: u64,
    pub provision_retries: u32,
    pub backend_url: String,
    pub backend_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            name_prefixes: vec!["NEBU-".to_string()],
            service_filter: Vec::new(),
            scan_duration_secs: 10,
            connect_timeout_ms: 10_000,
            connect_attempts: 3,
            connect_backoff_ms: 1_000,
            capability_timeout_ms: 10_000,
            provision_timeout_ms: 10_000,
            provision_retries: 2,
            backend_url: "http://127.0.0.1:9000".to_string(),
            backend_timeout_ms: 10_000,
            user_id: None,
        }
    }
}

impl PairingConfig {
    /// Load `$NEBU_HOME/config.json`, or defaults when the file does not exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&nebu_home()?.join("config.json"))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_filter().is_empty() {
            return Err(ConfigError::Invalid("namePrefixes and serviceFilter are both empty"));
        }
        if self.scan_duration_secs == 0 {
            return Err(ConfigError::Invalid("scanDurationSecs must be positive"));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid("connectAttempts must be at least 1"));
        }
        if [self.connect_timeout_ms, self.capability_timeout_ms, self.provision_timeout_ms, self.backend_timeout_ms]
            .contains(&0)
        {
            return Err(ConfigError::Invalid("timeouts must be positive"));
        }
        Ok(())
    }

    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            name_prefixes: self.name_prefixes.clone(),
            services: self.service_filter.clone(),
        }
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Wait after failed connect attempt `attempt`, saturating on overflow
    pub fn connect_backoff_after(&self, attempt: u32) -> Duration {
        self.connect_backoff().checked_mul(attempt).unwrap_or(Duration::MAX)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nebu-config-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("nebu-config-does-not-exist.json");
        let config = PairingConfig::load_from(&path).unwrap();
        assert_eq!(config, PairingConfig::default());
        assert_eq!(config.scan_filter(), ScanFilter::names(["NEBU-"]));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let path = temp_file("partial", r#"{"connectAttempts": 5, "userId": "user-1"}"#);
        let config = PairingConfig::load_from(&path).unwrap();
        assert_eq!(config.connect_attempts, 5);
        assert_eq!(config.user_id.as_deref(), Some("user-1"));
        assert_eq!(config.provision_retries, 2);
        assert_eq!(config.connect_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_unusable_values() {
        let path = temp_file("empty-filter", r#"{"namePrefixes": []}"#);
        assert!(matches!(PairingConfig::load_from(&path), Err(ConfigError::Invalid(_))));

        let path = temp_file("bad-json", "{not json");
        assert!(matches!(PairingConfig::load_from(&path), Err(ConfigError::Parse { .. })));

        let path = temp_file("zero-capability", r#"{"capabilityTimeoutMs": 0}"#);
        assert!(matches!(PairingConfig::load_from(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn backoff_is_linear_and_saturates() {
        let config = PairingConfig::default();
        assert_eq!(config.connect_backoff_after(1), Duration::from_secs(1));
        assert_eq!(config.connect_backoff_after(3), Duration::from_secs(3));

        let huge = PairingConfig { connect_backoff_ms: u64::MAX, ..PairingConfig::default() };
        assert_eq!(huge.connect_backoff_after(2), Duration::MAX);
    }
}
