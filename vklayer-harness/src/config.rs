//! Harness configuration.
//!
//! The configuration is a small TOML document. Every field has a default, so
//! an empty file (or no file at all) yields a working setup that targets the
//! Khronos validation layer through `VK_EXT_debug_report`.
//!
//! Lookup order used by [`HarnessConfig::load`]:
//! 1. the explicit path passed by the caller (the runner's `--config`),
//! 2. the path in the `VKLAYER_HARNESS_CONFIG` environment variable,
//! 3. [`HarnessConfig::default`].
//!
//! Loader-related variables (`VK_ICD_FILENAMES`, `VK_LAYER_PATH`,
//! `KHRONOS_PROFILES_EMULATE_PORTABILITY`) are deliberately not part of the
//! configuration; they reach the Vulkan loader untouched.

use ash::vk;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV_VAR: &str = "VKLAYER_HARNESS_CONFIG";

/// Loader variables that are reported at startup but never modified.
pub const PASSTHROUGH_ENV_VARS: &[&str] = &[
    "VK_ICD_FILENAMES",
    "VK_LAYER_PATH",
    "VK_INSTANCE_LAYERS",
    "KHRONOS_PROFILES_EMULATE_PORTABILITY",
];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub vulkan: VulkanConfig,
    pub monitor: MonitorConfig,
    pub shaders: ShaderToolConfig,
    pub logging: LoggingConfig,
}

/// Which debug extension feeds the diagnostic monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    #[default]
    DebugReport,
    DebugUtils,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulkanConfig {
    pub validation_layer: String,
    pub callback: CallbackKind,
    pub api_version: String,
    pub application_name: String,
    pub engine_name: String,
    pub render_target_width: u32,
    pub render_target_height: u32,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            validation_layer: "VK_LAYER_KHRONOS_validation".to_string(),
            callback: CallbackKind::DebugReport,
            api_version: "1.0".to_string(),
            application_name: "layer_tests".to_string(),
            engine_name: "unittest".to_string(),
            render_target_width: 32,
            render_target_height: 32,
        }
    }
}

impl VulkanConfig {
    /// The configured API version packed with `vk::make_api_version`.
    pub fn api_version(&self) -> Result<u32, ConfigError> {
        parse_api_version(&self.api_version).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "api_version '{}' is not of the form MAJOR.MINOR[.PATCH]",
                self.api_version
            ))
        })
    }

    pub fn render_target_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.render_target_width,
            height: self.render_target_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Count warning-severity records as failures in `expect_success` mode.
    pub warnings_fail_success: bool,
    /// Maximum number of trace lines kept per test.
    pub trace_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warnings_fail_success: false,
            trace_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderToolConfig {
    /// GLSL front end executable.
    pub glslang: PathBuf,
    /// SPIR-V assembler executable.
    pub spirv_as: PathBuf,
    /// Target environment passed to both tools.
    pub spirv_env: String,
}

impl Default for ShaderToolConfig {
    fn default() -> Self {
        Self {
            glslang: PathBuf::from("glslangValidator"),
            spirv_as: PathBuf::from("spirv-as"),
            spirv_env: "vulkan1.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Loads the configuration, falling back to defaults when no file is named.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from),
        };

        let config = match path {
            Some(path) => {
                info!("Loading harness configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => {
                debug!("No configuration file given; using defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vulkan.validation_layer.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "vulkan.validation_layer must not be empty".to_string(),
            ));
        }
        if self.vulkan.render_target_width == 0 || self.vulkan.render_target_height == 0 {
            return Err(ConfigError::ValidationError(format!(
                "render target extent {}x{} must be non-zero",
                self.vulkan.render_target_width, self.vulkan.render_target_height
            )));
        }
        self.vulkan.api_version()?;
        if self.monitor.trace_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.trace_capacity must be at least 1".to_string(),
            ));
        }
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {other}"
                )))
            }
        }
        match self.logging.format.to_lowercase().as_str() {
            "text" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {other}"
                )))
            }
        }
        Ok(())
    }
}

/// Parses `MAJOR.MINOR[.PATCH]` into a packed Vulkan version.
pub fn parse_api_version(text: &str) -> Option<u32> {
    let mut parts = text.trim().split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    let patch: u32 = match parts.next() {
        Some(patch) => patch.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() || major > 127 || minor > 1023 || patch > 4095 {
        return None;
    }
    Some(vk::make_api_version(0, major, minor, patch))
}

/// Formats a packed version as `MAJOR.MINOR.PATCH`.
pub fn format_api_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}
