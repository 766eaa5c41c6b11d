//! Configuration management module.
//!
//! The config file is read at startup and never written back.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::xbee::{DEFAULT_COMMAND_PORT, DEFAULT_SERIAL_PORT};

/// Configuration load result.
#[derive(Debug)]
pub enum ConfigLoadResult {
    /// Config loaded successfully.
    Loaded(AppConfig),
    /// Config file missing; defaults apply.
    Missing,
    /// Config file exists but invalid.
    Invalid(ConfigError),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
}

/// Discovery and addressing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Subnet to scan, CIDR (`192.168.1.0/24`) or dotted base (`192.168.1`).
    pub subnet: String,
    /// XBee application service port (default: 0xBEE).
    pub command_port: u16,
    /// XBee serial service port (default: 0x2616).
    pub serial_port: u16,
    /// How long a scan collects replies, in milliseconds.
    pub scan_window_ms: u64,
    /// Timeout for single AT queries such as the node name, in milliseconds.
    pub query_timeout_ms: u64,
}

/// Image loader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Full reset cycles allowed per load.
    pub max_attempts: u32,
    /// Image bytes per transfer datagram.
    pub chunk_size: usize,
    /// Pause between releasing reset and sending the handshake, in milliseconds.
    pub reset_delay_ms: u64,
    /// Wait for the handshake reply, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Wait for each chunk acknowledgement, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Wait for the checksum report after a RAM load, in milliseconds.
    pub verify_timeout_ms: u64,
    /// Wait for the checksum report after an EEPROM load, in milliseconds.
    pub eeprom_verify_timeout_ms: u64,
}

/// Largest chunk that still fits one XBee serial service datagram with its header.
pub const MAX_CHUNK_SIZE: usize = 1024;

impl AppConfig {
    /// Get config file path (platform config directory, falling back to the executable's).
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "Parallax", "xbee-loader")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            })
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Attempt to load config with detailed result.
    pub fn try_load(path: &Path) -> ConfigLoadResult {
        if !path.exists() {
            return ConfigLoadResult::Missing;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => ConfigLoadResult::Loaded(config),
                Err(e) => ConfigLoadResult::Invalid(e),
            },
            Err(e) => ConfigLoadResult::Invalid(ConfigError::Read(e)),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.subnet.trim().is_empty() {
            return Err(ConfigError::Validation("Subnet cannot be empty".to_string()));
        }
        if self.network.command_port == 0 {
            return Err(ConfigError::Validation("Command port must be greater than 0".to_string()));
        }
        if self.network.serial_port == 0 {
            return Err(ConfigError::Validation("Serial port must be greater than 0".to_string()));
        }
        if self.network.scan_window_ms < 100 {
            return Err(ConfigError::Validation(
                "Scan window must be at least 100 ms".to_string(),
            ));
        }
        if self.network.query_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "Query timeout must be greater than 0".to_string(),
            ));
        }
        if self.loader.max_attempts < 1 {
            return Err(ConfigError::Validation("Max attempts must be at least 1".to_string()));
        }
        if self.loader.chunk_size == 0 || self.loader.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Validation(format!(
                "Chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes"
            )));
        }
        if self.loader.handshake_timeout_ms == 0
            || self.loader.ack_timeout_ms == 0
            || self.loader.verify_timeout_ms == 0
            || self.loader.eeprom_verify_timeout_ms == 0
        {
            return Err(ConfigError::Validation(
                "Loader timeouts must be greater than 0".to_string(),
            ));
        }
        if self.loader.eeprom_verify_timeout_ms < self.loader.verify_timeout_ms {
            return Err(ConfigError::Validation(
                "EEPROM verify timeout cannot be shorter than the RAM verify timeout".to_string(),
            ));
        }
        Ok(())
    }
}

impl NetworkConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl LoaderConfig {
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn eeprom_verify_timeout(&self) -> Duration {
        Duration::from_millis(self.eeprom_verify_timeout_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: "192.168.1.0/24".to_string(),
            command_port: DEFAULT_COMMAND_PORT,
            serial_port: DEFAULT_SERIAL_PORT,
            scan_window_ms: 2000,
            query_timeout_ms: 1000,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            chunk_size: 512,
            reset_delay_ms: 100,
            handshake_timeout_ms: 500,
            ack_timeout_ms: 500,
            verify_timeout_ms: 2000,
            eeprom_verify_timeout_ms: 5000,
        }
    }
}
