//! Driver configuration management

use anyhow::{Context, Result, anyhow};
use common::UsbId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::usb::hotplug::{DEFAULT_MAX_MINORS, DEFAULT_MINOR_BASE};

/// Device the driver binds to when no id table is configured
pub const DEFAULT_DEVICE: UsbId = UsbId::new(0x0781, 0x5567);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Name used for device nodes (`<name>-<minor>`) and log messages
    #[serde(default = "DriverSettings::default_name")]
    pub name: String,
    #[serde(default = "DriverSettings::default_log_level")]
    pub log_level: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            log_level: Self::default_log_level(),
        }
    }
}

impl DriverSettings {
    fn default_name() -> String {
        "usbdev".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices to bind, as "VID:PID" hex pairs
    #[serde(default = "UsbSettings::default_id_table")]
    pub id_table: Vec<String>,
    #[serde(default = "UsbSettings::default_minor_base")]
    pub minor_base: u32,
    #[serde(default = "UsbSettings::default_max_minors")]
    pub max_minors: u32,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            id_table: Self::default_id_table(),
            minor_base: Self::default_minor_base(),
            max_minors: Self::default_max_minors(),
        }
    }
}

impl UsbSettings {
    fn default_id_table() -> Vec<String> {
        vec![DEFAULT_DEVICE.to_string()]
    }

    fn default_minor_base() -> u32 {
        DEFAULT_MINOR_BASE
    }

    fn default_max_minors() -> u32 {
        DEFAULT_MAX_MINORS
    }

    /// Parsed id table
    pub fn ids(&self) -> Result<IdTable> {
        self.id_table
            .iter()
            .map(|entry| {
                entry
                    .parse::<UsbId>()
                    .with_context(|| format!("Invalid id_table entry '{}'", entry))
            })
            .collect::<Result<Vec<_>>>()
            .map(IdTable::new)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bulk IN timeout in milliseconds
    #[serde(default = "TransferSettings::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Bulk OUT timeout used by the hardware writer thread
    #[serde(default = "TransferSettings::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// How long one libusb event-loop pass may block
    #[serde(default = "TransferSettings::default_event_poll_ms")]
    pub event_poll_ms: u64,
    /// Outbound requests queued per device before submission fails
    #[serde(default = "TransferSettings::default_write_queue_depth")]
    pub write_queue_depth: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: Self::default_read_timeout_ms(),
            write_timeout_ms: Self::default_write_timeout_ms(),
            event_poll_ms: Self::default_event_poll_ms(),
            write_queue_depth: Self::default_write_queue_depth(),
        }
    }
}

impl TransferSettings {
    fn default_read_timeout_ms() -> u64 {
        10_000
    }

    fn default_write_timeout_ms() -> u64 {
        10_000
    }

    fn default_event_poll_ms() -> u64 {
        100
    }

    fn default_write_queue_depth() -> usize {
        64
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

/// Vendor/product pairs this driver binds to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdTable {
    ids: Vec<UsbId>,
}

impl IdTable {
    pub fn new(ids: Vec<UsbId>) -> Self {
        Self { ids }
    }

    pub fn matches(&self, id: UsbId) -> bool {
        self.ids.contains(&id)
    }

    pub fn ids(&self) -> &[UsbId] {
        &self.ids
    }
}

impl Default for IdTable {
    fn default() -> Self {
        Self::new(vec![DEFAULT_DEVICE])
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/usbdev/driver.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
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
            config_dir.join("usbdev").join("driver.toml")
        } else {
            PathBuf::from(".config/usbdev/driver.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.driver.name.is_empty() {
            return Err(anyhow!("Driver name must not be empty"));
        }

        let ids = self.usb.ids()?;
        if ids.ids().is_empty() {
            return Err(anyhow!("id_table must list at least one VID:PID"));
        }

        if self.usb.max_minors == 0 {
            return Err(anyhow!("max_minors must be at least 1"));
        }
        if self.usb.minor_base.checked_add(self.usb.max_minors).is_none() {
            return Err(anyhow!(
                "Minor range {}+{} overflows",
                self.usb.minor_base,
                self.usb.max_minors
            ));
        }

        let t = &self.transfer;
        if t.read_timeout_ms == 0 || t.write_timeout_ms == 0 || t.event_poll_ms == 0 {
            return Err(anyhow!("Transfer timeouts must be greater than 0"));
        }
        if t.write_queue_depth == 0 {
            return Err(anyhow!("write_queue_depth must be at least 1"));
        }

        Ok(())
    }
}

/// Load configuration from a string path, expanding `~` and environment variables
pub fn load_config(path: &str) -> Result<DriverConfig> {
    let expanded = shellexpand::full(path)
        .with_context(|| format!("Failed to expand config path: {}", path))?;
    DriverConfig::load(Some(PathBuf::from(expanded.as_ref())))
}
