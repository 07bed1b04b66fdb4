use std::time::SystemTime;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CredentialError;

/// WiFi credentials held in memory for a single provisioning attempt
///
/// Never persisted and never cloned. Memory is zeroed on drop, and `Debug`
/// redacts the passphrase so the value cannot end up in logs.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WifiCredential {
    ssid: String,
    passphrase: String,
    #[zeroize(skip)]
    captured_at: SystemTime,
}

impl WifiCredential {
    /// SSID must be 1-32 bytes, passphrase empty (open network) or 8-63 bytes
    pub fn new(ssid: impl Into<String>, passphrase: impl Into<String>) -> Result<Self, CredentialError> {
        let mut ssid = ssid.into();
        let mut passphrase = passphrase.into();

        if let Err(e) = nebu_proto::check_credential_lengths(ssid.as_bytes(), passphrase.as_bytes()) {
            ssid.zeroize();
            passphrase.zeroize();
            return Err(CredentialError::Invalid(e));
        }

        Ok(Self { ssid, passphrase, captured_at: SystemTime::now() })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }
}

impl std::fmt::Debug for WifiCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifiCredential")
            .field("ssid", &self.ssid)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_lengths() {
        assert!(WifiCredential::new("Home-5G", "abc12345").is_ok());
        assert!(WifiCredential::new("Cafe", "").is_ok());
        assert_eq!(
            WifiCredential::new("", "abc12345").unwrap_err(),
            CredentialError::Invalid("SSID must be 1-32 bytes")
        );
        assert!(WifiCredential::new("Home-5G", "1234567").is_err());
        assert!(WifiCredential::new("x".repeat(33), "").is_err());
        assert!(WifiCredential::new("Home-5G", "p".repeat(64)).is_err());
    }

    #[test]
    fn debug_never_shows_passphrase() {
        let credential = WifiCredential::new("Home-5G", "abc12345").unwrap();
        let shown = format!("{credential:?}");
        assert!(shown.contains("Home-5G"));
        assert!(!shown.contains("abc12345"));
    }

    #[test]
    fn zeroize_clears_secret() {
        let mut credential = WifiCredential::new("Home-5G", "abc12345").unwrap();
        credential.zeroize();
        assert!(credential.ssid().is_empty());
        assert!(credential.passphrase().is_empty());
    }
}
