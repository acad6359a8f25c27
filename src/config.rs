//! Engine configuration.
//!
//! Loaded once from TOML (or built in code) and handed to the device
//! manager. Capability lists are not configured here; they are aggregated
//! from the registered services at handshake time.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub telephony: TelephonyConfig,
    #[serde(default)]
    pub paths: PathConfig,
}

/// Host identity advertised to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub id: String,
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Seconds an unanswered pairing request stays pending.
    #[serde(default = "default_pairing_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    /// Quiet period, in seconds, that closes an SMS fragment burst.
    #[serde(default = "default_sms_debounce")]
    pub sms_debounce_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Where the known-device registry is persisted.
    #[serde(default = "default_registry_path")]
    pub device_registry: PathBuf,
}

fn default_device_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "peerlink-host".to_string())
}

fn default_device_type() -> String {
    "desktop".to_string()
}

fn default_pairing_timeout() -> u64 {
    30
}

fn default_sms_debounce() -> u64 {
    5
}

fn default_registry_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peerlink")
        .join("devices.json")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
            name: default_device_name(),
            device_type: default_device_type(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_pairing_timeout(),
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            sms_debounce_secs: default_sms_debounce(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            device_registry: default_registry_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            pairing: PairingConfig::default(),
            telephony: TelephonyConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)
            .map_err(|e| ProtocolError::Configuration(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.id.is_empty() {
            return Err(ProtocolError::Configuration(
                "device id must not be empty".to_string(),
            ));
        }
        if self.device.name.is_empty() {
            return Err(ProtocolError::Configuration(
                "device name must not be empty".to_string(),
            ));
        }
        if self.pairing.timeout_secs == 0 {
            return Err(ProtocolError::Configuration(
                "pairing timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing.timeout_secs)
    }

    pub fn sms_debounce(&self) -> Duration {
        Duration::from_secs(self.telephony.sms_debounce_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.pairing.timeout_secs, 30);
        assert_eq!(config.telephony.sms_debounce_secs, 5);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [device]
            id = "host-1"
            name = "Workstation"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.id, "host-1");
        assert_eq!(config.device.device_type, "desktop");
        assert_eq!(config.pairing_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Config::from_toml(
            r#"
            [pairing]
            timeout_secs = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[device]\nid = \"abc\"\nname = \"n\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.device.id, "abc");
    }
}
