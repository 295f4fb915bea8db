//! Service configuration management

use crate::usb::{AdapterProfile, EngineSettings, gamecube_setup_sequence};
use anyhow::{Context, Result, anyhow};
use protocol::{
    ADAPTER_PRODUCT_ID, ADAPTER_VENDOR_ID, BEGIN_POLLING_PACKET, ControlSetup, PAGE_SIZE,
    READ_PACKET_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    /// Slot acquisition tunables
    #[serde(default)]
    pub engine: EngineConfig,
    /// Adapter identity and setup sequence
    #[serde(default)]
    pub device: DeviceConfig,
    /// Call capture
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub service_mode: bool,
    /// Interval of the packet snapshot log line (0 = disabled)
    #[serde(default = "ServerSettings::default_monitor_interval")]
    pub monitor_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            service_mode: false,
            monitor_interval_ms: Self::default_monitor_interval(),
        }
    }
}

impl ServerSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_monitor_interval() -> u64 {
        1000
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wait between open attempts while a slot is shutting down
    #[serde(default = "EngineConfig::default_open_retry_delay")]
    pub open_retry_delay_us: u64,
    /// Open attempts before giving up
    #[serde(default = "EngineConfig::default_open_retry_limit")]
    pub open_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            open_retry_delay_us: Self::default_open_retry_delay(),
            open_retry_limit: Self::default_open_retry_limit(),
        }
    }
}

impl EngineConfig {
    fn default_open_retry_delay() -> u64 {
        100
    }

    fn default_open_retry_limit() -> u32 {
        10_000
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "DeviceConfig::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "DeviceConfig::default_product_id")]
    pub product_id: u16,
    #[serde(default = "DeviceConfig::default_read_endpoint")]
    pub read_endpoint: u8,
    #[serde(default = "DeviceConfig::default_write_endpoint")]
    pub write_endpoint: u8,
    #[serde(default = "DeviceConfig::default_read_size")]
    pub read_size: usize,
    #[serde(default = "DeviceConfig::default_begin_polling_packet")]
    pub begin_polling_packet: Vec<u8>,
    #[serde(default = "gamecube_setup_sequence")]
    pub setup_sequence: Vec<ControlSetup>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            read_endpoint: Self::default_read_endpoint(),
            write_endpoint: Self::default_write_endpoint(),
            read_size: Self::default_read_size(),
            begin_polling_packet: Self::default_begin_polling_packet(),
            setup_sequence: gamecube_setup_sequence(),
        }
    }
}

impl DeviceConfig {
    fn default_vendor_id() -> u16 {
        ADAPTER_VENDOR_ID
    }

    fn default_product_id() -> u16 {
        ADAPTER_PRODUCT_ID
    }

    fn default_read_endpoint() -> u8 {
        0x81
    }

    fn default_write_endpoint() -> u8 {
        0x02
    }

    fn default_read_size() -> usize {
        READ_PACKET_SIZE
    }

    fn default_begin_polling_packet() -> Vec<u8> {
        vec![BEGIN_POLLING_PACKET]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Capture file; `~` is expanded
    #[serde(default = "CaptureConfig::default_path")]
    pub path: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: Self::default_path(),
        }
    }
}

impl CaptureConfig {
    fn default_path() -> PathBuf {
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("gc-usb-proxy").join("capture.bin")
        } else {
            PathBuf::from("/var/log/gc-usb-proxy/capture.bin")
        }
    }

    /// Capture path with `~` expanded
    pub fn resolved_path(&self) -> PathBuf {
        let raw = self.path.to_string_lossy();
        PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/gc-usb-proxy/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
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
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

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
            config_dir.join("gc-usb-proxy").join("server.toml")
        } else {
            PathBuf::from(".config/gc-usb-proxy/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        let device = &self.device;
        if device.setup_sequence.is_empty() {
            return Err(anyhow!("device.setup_sequence must not be empty"));
        }
        Self::validate_size("device.read_size", device.read_size)?;
        Self::validate_size(
            "device.begin_polling_packet",
            device.begin_polling_packet.len(),
        )?;
        if device.read_endpoint & 0x80 == 0 {
            return Err(anyhow!(
                "Invalid read_endpoint {:#04x}, must be an IN endpoint (bit 7 set)",
                device.read_endpoint
            ));
        }
        if device.write_endpoint & 0x80 != 0 {
            return Err(anyhow!(
                "Invalid write_endpoint {:#04x}, must be an OUT endpoint (bit 7 clear)",
                device.write_endpoint
            ));
        }

        Ok(())
    }

    fn validate_size(name: &str, size: usize) -> Result<()> {
        if size == 0 || size > PAGE_SIZE {
            return Err(anyhow!(
                "Invalid {} {:#x}, must be between 1 and {:#x}",
                name,
                size,
                PAGE_SIZE
            ));
        }
        Ok(())
    }

    /// Adapter profile the engine is driven by
    pub fn profile(&self) -> AdapterProfile {
        AdapterProfile {
            read_endpoint: self.device.read_endpoint,
            write_endpoint: self.device.write_endpoint,
            read_size: self.device.read_size,
            begin_polling_packet: self.device.begin_polling_packet.clone(),
            setup_sequence: self.device.setup_sequence.clone(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            open_retry_delay: Duration::from_micros(self.engine.open_retry_delay_us),
            open_retry_limit: self.engine.open_retry_limit,
        }
    }

    pub fn monitor_interval(&self) -> Option<Duration> {
        match self.server.monitor_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.device.vendor_id, 0x057e);
        assert_eq!(config.device.product_id, 0x0337);
        assert_eq!(config.device.setup_sequence.len(), 6);
        assert!(!config.capture.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_profile_matches_engine_default() {
        assert_eq!(ServerConfig::default().profile(), AdapterProfile::default());
        assert_eq!(
            ServerConfig::default().engine_settings(),
            EngineSettings::default()
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ServerConfig::default();
        config.server.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.server.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_sizes() {
        let mut config = ServerConfig::default();
        config.device.read_size = 0;
        assert!(config.validate().is_err());

        config.device.read_size = PAGE_SIZE + 1;
        assert!(config.validate().is_err());

        config.device.read_size = PAGE_SIZE;
        assert!(config.validate().is_ok());

        config.device.begin_polling_packet.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_endpoint_direction() {
        let mut config = ServerConfig::default();
        config.device.read_endpoint = 0x01;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.device.write_endpoint = 0x82;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_monitor_interval_zero_disables() {
        let mut config = ServerConfig::default();
        assert_eq!(config.monitor_interval(), Some(Duration::from_secs(1)));
        config.server.monitor_interval_ms = 0;
        assert_eq!(config.monitor_interval(), None);
    }
}
