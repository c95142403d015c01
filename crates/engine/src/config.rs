//! Configuration management for the Tether engine.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tether/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::DeviceClass;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("device_name must be non-empty and at most 64 characters, got {0} characters")]
    InvalidDeviceName(usize),

    #[error("discovery_port and control_port must differ, both set to {0}")]
    PortCollision(u16),

    #[error("broadcast_interval must be between 1 and 300 seconds, got {0}")]
    InvalidBroadcastInterval(u64),

    #[error("liveness_timeout must be greater than broadcast_interval ({interval}s), got {timeout}s")]
    InvalidLivenessTimeout { timeout: u64, interval: u64 },

    #[error("pairing_timeout must be between 5 and 600 seconds, got {0}")]
    InvalidPairingTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Tether engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Local device presentation.
    pub device: DeviceConfig,

    /// Network ports and discovery tuning.
    pub network: NetworkConfig,

    /// Pairing behavior.
    pub pairing: PairingConfig,

    /// Payload transfer tuning.
    pub transfer: TransferConfig,
}

/// Local device presentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Human-readable device name announced to peers.
    pub name: String,

    /// Device class announced to peers (phone, desktop, tablet, tv, laptop).
    pub class: DeviceClass,

    /// Directory for storing engine data (identity key, trust store).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Network ports and discovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port for discovery broadcasts.
    pub discovery_port: u16,

    /// TCP port for incoming control connections. 0 means OS-assigned.
    pub control_port: u16,

    /// Seconds between discovery broadcasts.
    pub broadcast_interval: u64,

    /// Seconds without an identity broadcast before a device is
    /// considered lost.
    pub liveness_timeout: u64,
}

/// Pairing behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PairingConfig {
    /// Seconds before a pending pairing request expires.
    pub request_timeout: u64,
}

/// Payload transfer tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Milliseconds between progress callbacks for an active transfer.
    pub progress_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            class: DeviceClass::Desktop,
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: 33721,
            control_port: 0,
            broadcast_interval: 5,
            liveness_timeout: 30,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            request_timeout: 30,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 100,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

/// Returns a default device name derived from the hostname.
fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "tether-device".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TETHER_DEVICE_NAME: Override the announced device name
    /// - TETHER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("TETHER_DEVICE_NAME") {
            if !name.is_empty() {
                tracing::info!("Overriding device name from environment: {}", name);
                self.device.name = name;
            }
        }

        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.device.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name_len = self.device.name.chars().count();
        if name_len == 0 || name_len > 64 {
            return Err(ConfigError::InvalidDeviceName(name_len));
        }

        if self.network.control_port != 0
            && self.network.control_port == self.network.discovery_port
        {
            return Err(ConfigError::PortCollision(self.network.control_port));
        }

        if self.network.broadcast_interval < 1 || self.network.broadcast_interval > 300 {
            return Err(ConfigError::InvalidBroadcastInterval(
                self.network.broadcast_interval,
            ));
        }

        if self.network.liveness_timeout <= self.network.broadcast_interval {
            return Err(ConfigError::InvalidLivenessTimeout {
                timeout: self.network.liveness_timeout,
                interval: self.network.broadcast_interval,
            });
        }

        if self.pairing.request_timeout < 5 || self.pairing.request_timeout > 600 {
            return Err(ConfigError::InvalidPairingTimeout(
                self.pairing.request_timeout,
            ));
        }

        let level = self.device.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.device.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.device.log_level, "info");
        assert_eq!(config.device.class, DeviceClass::Desktop);
        assert_eq!(config.network.discovery_port, 33721);
        assert_eq!(config.network.control_port, 0);
        assert_eq!(config.network.broadcast_interval, 5);
        assert_eq!(config.network.liveness_timeout, 30);
        assert_eq!(config.pairing.request_timeout, 30);
        assert_eq!(config.transfer.progress_interval_ms, 100);
    }

    #[test]
    fn test_default_device_config() {
        let config = DeviceConfig::default();
        assert!(!config.name.is_empty());
        assert!(config.data_dir.to_string_lossy().contains("tether"));
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[device]
log_level = "debug"

[network]
discovery_port = 40000
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.device.log_level, "debug");
        assert_eq!(config.network.discovery_port, 40000);
        // Other values should be defaults
        assert_eq!(config.network.broadcast_interval, 5);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[device]
name = "workbench"
class = "laptop"
data_dir = "/custom/data"
log_level = "trace"

[network]
discovery_port = 40000
control_port = 40001
broadcast_interval = 10
liveness_timeout = 60

[pairing]
request_timeout = 120

[transfer]
progress_interval_ms = 250
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.device.name, "workbench");
        assert_eq!(config.device.class, DeviceClass::Laptop);
        assert_eq!(config.device.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.device.log_level, "trace");
        assert_eq!(config.network.discovery_port, 40000);
        assert_eq!(config.network.control_port, 40001);
        assert_eq!(config.network.broadcast_interval, 10);
        assert_eq!(config.network.liveness_timeout, 60);
        assert_eq!(config.pairing.request_timeout, 120);
        assert_eq!(config.transfer.progress_interval_ms, 250);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[device
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[network]
discovery_port = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let original = Config::default();
        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut original = Config::default();
        original.device.log_level = "debug".to_string();
        original.network.discovery_port = 41000;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_save_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir
            .path()
            .join("nested")
            .join("dirs")
            .join("config.toml");

        let config = Config::default();
        config.save(&config_path).unwrap();

        assert!(config_path.exists());
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let result = Config::load(&config_path);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_device_name() {
        let mut config = Config::default();
        config.device.name = String::new();
        assert_eq!(config.validate(), Err(ConfigError::InvalidDeviceName(0)));
    }

    #[test]
    fn test_validate_device_name_too_long() {
        let mut config = Config::default();
        config.device.name = "x".repeat(65);
        assert_eq!(config.validate(), Err(ConfigError::InvalidDeviceName(65)));
    }

    #[test]
    fn test_validate_port_collision() {
        let mut config = Config::default();
        config.network.discovery_port = 5000;
        config.network.control_port = 5000;
        assert_eq!(config.validate(), Err(ConfigError::PortCollision(5000)));
    }

    #[test]
    fn test_validate_os_assigned_control_port_ok() {
        let mut config = Config::default();
        config.network.control_port = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_broadcast_interval_zero() {
        let mut config = Config::default();
        config.network.broadcast_interval = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBroadcastInterval(0))
        );
    }

    #[test]
    fn test_validate_liveness_not_greater_than_interval() {
        let mut config = Config::default();
        config.network.broadcast_interval = 10;
        config.network.liveness_timeout = 10;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLivenessTimeout {
                timeout: 10,
                interval: 10
            })
        );
    }

    #[test]
    fn test_validate_pairing_timeout_bounds() {
        let mut config = Config::default();

        config.pairing.request_timeout = 4;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPairingTimeout(4)));

        config.pairing.request_timeout = 601;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPairingTimeout(601))
        );

        config.pairing.request_timeout = 5;
        assert!(config.validate().is_ok());

        config.pairing.request_timeout = 600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level_case_insensitive() {
        let mut config = Config::default();

        config.device.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.device.log_level = "Info".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level_invalid() {
        let mut config = Config::default();
        config.device.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_device_class_serialization() {
        let toml = r#"
[device]
class = "tv"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.device.class, DeviceClass::Tv);
    }
}
