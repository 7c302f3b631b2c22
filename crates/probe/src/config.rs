//! Probe configuration management

use crate::usb::device::ClaimPolicy;
use crate::usb::matcher::{DeviceIdentity, STRING_DESCRIPTOR_CAPACITY};
use crate::usb::transfers::{ReadLoopSettings, TAG_CAPACITY};
use anyhow::{Context, Result, anyhow};
use common::HostCapabilities;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub probe: ProbeSettings,
    pub device: DeviceSettings,
    #[serde(default)]
    pub claim: ClaimSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub log_level: String,
}

/// Identity of the device to look for
///
/// IDs are hex strings (`"0x03EB"`); strings are compared exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub vendor_id: String,
    pub product_id: String,
    pub manufacturer: String,
    pub product: String,
}

/// When to ask the host stack to detach kernel drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KernelDriverMode {
    /// Only when the host reports detach support
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimSettings {
    #[serde(default)]
    pub kernel_driver: KernelDriverMode,
    /// Claim interfaces of categories with no endpoints too
    #[serde(default)]
    pub claim_unused_categories: bool,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            kernel_driver: KernelDriverMode::Auto,
            claim_unused_categories: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bulk IN buffer length in bytes
    #[serde(default = "TransferSettings::default_buffer_len")]
    pub buffer_len: usize,
    /// Bulk IN timeout in milliseconds (0 waits forever)
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Prefix written into the buffer before each read
    #[serde(default = "TransferSettings::default_sentinel")]
    pub sentinel: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            buffer_len: Self::default_buffer_len(),
            timeout_ms: Self::default_timeout_ms(),
            sentinel: Self::default_sentinel(),
        }
    }
}

impl TransferSettings {
    fn default_buffer_len() -> usize {
        1024
    }

    fn default_timeout_ms() -> u64 {
        1000
    }

    fn default_sentinel() -> String {
        "deadbeef: ".to_string()
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe: ProbeSettings {
                log_level: "info".to_string(),
            },
            device: DeviceSettings {
                vendor_id: "0x03EB".to_string(),
                product_id: "0x2423".to_string(),
                manufacturer: "Mohammad El-Sabae".to_string(),
                product: "libusb".to_string(),
            },
            claim: ClaimSettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/vendor-usb-probe/probe.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ProbeConfig = toml::from_str(&content)
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
            config_dir.join("vendor-usb-probe").join("probe.toml")
        } else {
            PathBuf::from(".config/vendor-usb-probe/probe.toml")
        }
    }

    /// Identity the matcher compares candidates against
    pub fn identity(&self) -> Result<DeviceIdentity> {
        Ok(DeviceIdentity {
            vendor_id: parse_hex_id(&self.device.vendor_id, "vendor_id")?,
            product_id: parse_hex_id(&self.device.product_id, "product_id")?,
            manufacturer: self.device.manufacturer.clone(),
            product: self.device.product.clone(),
        })
    }

    /// Claim policy given what the host stack supports
    pub fn claim_policy(&self, capabilities: HostCapabilities) -> ClaimPolicy {
        let auto_detach_kernel_driver = match self.claim.kernel_driver {
            KernelDriverMode::Auto => capabilities.kernel_driver_detach,
            KernelDriverMode::Always => true,
            KernelDriverMode::Never => false,
        };

        ClaimPolicy {
            auto_detach_kernel_driver,
            claim_unused_categories: self.claim.claim_unused_categories,
        }
    }

    /// Read loop settings, optionally bounded to `count` polls
    pub fn read_loop(&self, count: Option<u64>) -> ReadLoopSettings {
        ReadLoopSettings {
            buffer_len: self.transfer.buffer_len,
            timeout: Duration::from_millis(self.transfer.timeout_ms),
            sentinel: self.transfer.sentinel.clone(),
            count,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.probe.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.probe.log_level,
                valid_levels.join(", ")
            ));
        }

        parse_hex_id(&self.device.vendor_id, "vendor_id")?;
        parse_hex_id(&self.device.product_id, "product_id")?;

        for (name, value) in [
            ("manufacturer", &self.device.manufacturer),
            ("product", &self.device.product),
        ] {
            if value.is_empty() {
                return Err(anyhow!("Device {} string must not be empty", name));
            }
            if !value.is_ascii() {
                return Err(anyhow!("Device {} string '{}' must be ASCII", name, value));
            }
            if value.len() >= STRING_DESCRIPTOR_CAPACITY {
                return Err(anyhow!(
                    "Device {} string is {} bytes, at most {} can be read back",
                    name,
                    value.len(),
                    STRING_DESCRIPTOR_CAPACITY - 1
                ));
            }
        }

        if self.transfer.sentinel.is_empty() {
            return Err(anyhow!("Transfer sentinel must not be empty"));
        }
        // The tag needs room for at least one counter digit
        if self.transfer.sentinel.len() >= TAG_CAPACITY - 1 {
            return Err(anyhow!(
                "Transfer sentinel is {} bytes, at most {} fit in the tag",
                self.transfer.sentinel.len(),
                TAG_CAPACITY - 2
            ));
        }
        if self.transfer.buffer_len < self.transfer.sentinel.len() {
            return Err(anyhow!(
                "Transfer buffer_len {} is shorter than the sentinel ({} bytes)",
                self.transfer.buffer_len,
                self.transfer.sentinel.len()
            ));
        }

        Ok(())
    }
}

/// Parse a hex ID (VID or PID) such as `0x03EB`
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    if !id.starts_with("0x") && !id.starts_with("0X") {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
            name,
            id
        ));
    }

    let hex_part = &id[2..];
    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<ProbeConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ProbeConfig::load(Some(path_buf))
}
