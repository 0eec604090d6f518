/*!
Configuration management for the capture tool.
*/

use anyhow::{Context, Result};
use lepton::protocol::{DEFAULT_I2C_PATH, DEFAULT_SPI_PATH, DEFAULT_SPI_SPEED_HZ};
use lepton::ReaderConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// Where the camera is attached
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// spidev node carrying the video stream
    pub spi_path: String,

    /// SPI clock in Hz (at most 20 MHz)
    pub spi_speed_hz: u32,

    /// i2c-dev node carrying the command channel
    pub i2c_path: String,

    /// Use the simulated camera instead of hardware
    pub simulate: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            spi_path: DEFAULT_SPI_PATH.to_string(),
            spi_speed_hz: DEFAULT_SPI_SPEED_HZ,
            i2c_path: DEFAULT_I2C_PATH.to_string(),
            simulate: false,
        }
    }
}

/// Capture run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub reader: ReaderConfig,

    /// Output directory for frame files
    pub output_directory: String,

    /// Write frame files; otherwise print metadata to stdout
    pub save_files: bool,

    /// Stop after this many frames (0 = run until interrupted)
    pub frame_limit: u64,

    /// Statistics reporting interval in seconds
    pub stats_interval_seconds: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            reader: ReaderConfig::default(),
            output_directory: "./frames".to_string(),
            save_files: true,
            frame_limit: 0,
            stats_interval_seconds: 10,
        }
    }
}
