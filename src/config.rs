// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Instance, device selection, logging and demo workload settings.
// Every section has defaults, so a missing file or section is not an error.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::error::Error;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub instance: InstanceConfig,
    pub device: DeviceConfig,
    pub logging: LoggingConfig,
    pub saxpy: SaxpyConfig,
}

/// Instance creation settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub application_name: String,
    pub application_version: [u32; 3],
    /// "1.0" through "1.3"
    pub api_version: String,
    pub layers: Vec<String>,
    pub extensions: Vec<String>,
    /// Enable VK_LAYER_KHRONOS_validation and route its messages to the report sink
    pub validation: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            application_name: "vk-dispatch".to_string(),
            application_version: [0, 1, 0],
            api_version: "1.1".to_string(),
            layers: Vec::new(),
            extensions: Vec::new(),
            validation: cfg!(debug_assertions),
        }
    }
}

impl InstanceConfig {
    /// Requested API version as a Vulkan version number
    pub fn api_version(&self) -> Result<u32, Error> {
        match self.api_version.trim() {
            "1.0" => Ok(vk::API_VERSION_1_0),
            "1.1" => Ok(vk::API_VERSION_1_1),
            "1.2" => Ok(vk::API_VERSION_1_2),
            "1.3" => Ok(vk::API_VERSION_1_3),
            other => Err(Error::precondition(format!(
                "unsupported api_version '{other}', expected 1.0 to 1.3"
            ))),
        }
    }
}

/// Physical device selection
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Explicit index into the enumerated devices; overrides `prefer`
    pub index: Option<usize>,
    /// "discrete", "integrated" or "any"
    pub prefer: String,
    /// Use a transfer-only queue family for copies when the device has one
    pub dedicated_transfer: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: None,
            prefer: "discrete".to_string(),
            dedicated_transfer: true,
        }
    }
}

impl DeviceConfig {
    pub fn preferred_type(&self) -> Option<vk::PhysicalDeviceType> {
        match self.prefer.to_lowercase().as_str() {
            "discrete" => Some(vk::PhysicalDeviceType::DISCRETE_GPU),
            "integrated" => Some(vk::PhysicalDeviceType::INTEGRATED_GPU),
            "any" => None,
            _ => {
                log::warn!("Unknown device preference '{}', accepting any device", self.prefer);
                None
            }
        }
    }
}

/// Logging settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', using info", self.level);
            log::LevelFilter::Info
        })
    }
}

/// Demo workload: y = a * x + y
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SaxpyConfig {
    pub size: u32,
    pub a: f32,
    pub workgroup_size: u32,
    pub shader: PathBuf,
}

impl Default for SaxpyConfig {
    fn default() -> Self {
        Self {
            size: 1 << 20,
            a: 0.1,
            workgroup_size: 64,
            shader: PathBuf::from("shaders/saxpy.spv"),
        }
    }
}

impl SaxpyConfig {
    /// Workgroups needed to cover `size` elements
    pub fn groups(&self) -> u32 {
        self.size.div_ceil(self.workgroup_size.max(1))
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.instance.api_version()?;
        Ok(config)
    }
}
