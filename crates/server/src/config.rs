//! Server configuration management
//!
//! The config file is JSON and round-trips losslessly; `bind`/`unbind`
//! mutate `allowed_devices` and persist the file in place.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default USB/IP port
pub const DEFAULT_PORT: u16 = 3240;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// TCP port the listener binds to
    pub port: u16,
    /// Default log level when RUST_LOG is unset
    pub log_level: String,
    /// Verbose request/reply logging
    pub debug_mode: bool,
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Per-connection idle timeout in seconds
    pub connection_timeout: u64,
    /// Exportable device allow-list; empty means all devices are exportable
    pub allowed_devices: Vec<String>,
    /// Bind every enumerated device at daemon startup
    pub auto_bind_devices: bool,
    /// Optional log file; logs also go to stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
            debug_mode: false,
            max_connections: 10,
            connection_timeout: 30,
            allowed_devices: Vec::new(),
            auto_bind_devices: false,
            log_file_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbipd/config.json"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbipd").join("config.json")
        } else {
            PathBuf::from(".config/usbipd/config.json")
        }
    }

    /// Path of the persisted claim-state file, next to the config
    pub fn default_claims_path() -> PathBuf {
        Self::default_path().with_file_name("claims.json")
    }

    /// Path of the daemon status snapshot, next to the config
    pub fn default_status_path() -> PathBuf {
        Self::default_path().with_file_name("status.json")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("Invalid port 0"));
        }

        if self.max_connections == 0 {
            return Err(anyhow!("max_connections must be greater than zero"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        for entry in &self.allowed_devices {
            if !protocol::is_valid_bus_id(entry) && !protocol::is_valid_device_key(entry) {
                return Err(anyhow!(
                    "Invalid allowed device '{}', expected a bus id like '1-1' or a device key",
                    entry
                ));
            }
        }

        Ok(())
    }

    /// Whether a device passes the allow-list
    ///
    /// An entry matches on the bus id alone (how `bind` records devices) or
    /// on the full device key.
    pub fn is_device_allowed(&self, bus_id: &str, device_key: &str) -> bool {
        if self.allowed_devices.is_empty() {
            return true;
        }
        self.allowed_devices
            .iter()
            .any(|entry| entry == bus_id || entry == device_key)
    }
}

/// Load a config from a path with tilde expansion
pub fn load_config(path: &str) -> Result<ServerConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ServerConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3240);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.log_level, "info");
        assert!(config.allowed_devices.is_empty());
        assert!(!config.auto_bind_devices);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip_lossless() {
        let config = ServerConfig {
            port: 3241,
            log_level: "debug".to_string(),
            debug_mode: true,
            max_connections: 4,
            connection_timeout: 120,
            allowed_devices: vec!["1-1".to_string(), "3-2.1".to_string()],
            auto_bind_devices: true,
            log_file_path: Some(PathBuf::from("/var/log/usbipd.log")),
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();

        config.max_connections = 0;
        assert!(config.validate().is_err());
        config.max_connections = 10;

        config.log_level = "noisy".to_string();
        assert!(config.validate().is_err());
        config.log_level = "warn".to_string();

        config.allowed_devices = vec!["not a busid".to_string()];
        assert!(config.validate().is_err());
        config.allowed_devices = vec!["1-1".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_allow_list_matching() {
        let mut config = ServerConfig::default();
        assert!(config.is_device_allowed("1-1", "1-1-1-4"));

        config.allowed_devices = vec!["1-1".to_string()];
        assert!(config.is_device_allowed("1-1", "1-1-1-4"));
        assert!(!config.is_device_allowed("2-1", "2-1-2-3"));

        config.allowed_devices = vec!["2-1-2-3".to_string()];
        assert!(config.is_device_allowed("2-1", "2-1-2-3"));
    }
}
