//! Daemon configuration: YAML file describing devices, telemetry and
//! storage.
//!
//! Device entries are adjacently tagged: the `type` field selects the
//! family and `config` carries that family's options.
//!
//! ```yaml
//! settings:
//!   logLevel: info
//! devices:
//!   - name: rtl0
//!     type: rtl-sdr
//!     enabled: true
//!     config:
//!       frequencyStart: 100000000
//!       frequencyEnd: 200000000
//!       binWidth: 100000
//!     buffer:
//!       capacity: 32
//!       flushCount: 8
//! storage:
//!   dataDirectory: data
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use airsweep_core::sdr::{hackrf, rtl, ConfigError};

/// Failure to load or validate the configuration file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("reading configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A device entry failed its family's validation.
    #[error("device {name:?}: {source}")]
    Device {
        name: String,
        #[source]
        source: ConfigError,
    },
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub settings: Settings,
    pub devices: Vec<DeviceConfig>,
    pub telemetry: Option<TelemetryConfig>,
    pub storage: StorageConfig,
}

/// Global application settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_level: "info".to_string(),
        }
    }
}

/// One device entry. Disabled entries are registered nowhere and silently
/// skipped by the orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: DeviceSettings,
    #[serde(default)]
    pub buffer: Option<BufferConfig>,
}

/// Validated per-family device settings with a uniform surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum DeviceSettings {
    #[serde(rename = "rtl-sdr")]
    RtlSdr(rtl::Config),
    #[serde(rename = "hackrf")]
    HackRf(hackrf::Config),
}

impl DeviceSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DeviceSettings::RtlSdr(config) => config.validate(),
            DeviceSettings::HackRf(config) => config.validate(),
        }
    }

    pub fn args(&self) -> Result<Vec<String>, ConfigError> {
        match self {
            DeviceSettings::RtlSdr(config) => config.args(),
            DeviceSettings::HackRf(config) => config.args(),
        }
    }

    pub fn device_type(&self) -> &'static str {
        match self {
            DeviceSettings::RtlSdr(_) => rtl::DEVICE,
            DeviceSettings::HackRf(_) => hackrf::DEVICE,
        }
    }
}

/// Reassembly buffer sizing for one device.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConfig {
    pub capacity: usize,
    pub flush_count: usize,
}

/// Telemetry feed settings. The serial source itself is wired up by the
/// deployment; the daemon only carries the descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetryConfig {
    pub serial_port: String,
    pub baud_rate: u32,
    /// Snapshot refresh interval in seconds.
    pub update_interval: f64,
    pub enabled: bool,
    pub types: Vec<TelemetryType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryType {
    Gps,
    Imu,
    Radio,
    Barometer,
    Magnetometer,
}

/// Storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub data_directory: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_directory: "data".to_string(),
        }
    }
}

impl Config {
    /// Read and parse a configuration file, validating every enabled device
    /// entry.
    pub fn load(path: &Path) -> Result<Config, ConfigFileError> {
        let contents = std::fs::read_to_string(path)?;
        Config::parse(&contents)
    }

    /// Parse a configuration document from YAML text.
    pub fn parse(contents: &str) -> Result<Config, ConfigFileError> {
        let config: Config = serde_yaml::from_str(contents)?;
        for device in config.devices.iter().filter(|d| d.enabled) {
            device
                .settings
                .validate()
                .map_err(|source| ConfigFileError::Device {
                    name: device.name.clone(),
                    source,
                })?;
        }
        Ok(config)
    }
}
