//! Renderer backend configuration
//!
//! Sizes, feature toggles and paths consumed at backend initialization.
//! Values come from the embedding application (config file, console
//! variables); this module only defines the schema and TOML parsing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// TOML syntax or schema mismatch
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value was syntactically valid but unusable
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Backend configuration with worst-case per-frame sizing knobs
///
/// The dynamic buffer capacities are fixed for the lifetime of the
/// backend and must cover the worst-case draw volume of a single frame;
/// exceeding them mid-frame is a fatal condition. The staging buffer is
/// only an initial size and grows on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Application name reported to the Vulkan driver
    pub app_name: String,
    /// Initial staging buffer capacity in KiB (grows by doubling)
    pub staging_buffer_size_kb: u32,
    /// Per-slot dynamic vertex buffer capacity in KiB
    pub dynamic_vertex_buffer_size_kb: u32,
    /// Per-slot dynamic index buffer capacity in KiB
    pub dynamic_index_buffer_size_kb: u32,
    /// Per-slot dynamic uniform buffer capacity in KiB
    pub dynamic_uniform_buffer_size_kb: u32,
    /// Requested MSAA sample count (clamped to device support)
    pub desired_sample_count: u32,
    /// Present with FIFO (vsync) instead of MAILBOX/IMMEDIATE
    pub vsync: bool,
    /// Enable validation layers and the debug messenger
    pub validation: bool,
    /// Directory containing compiled SPIR-V shader binaries
    pub shader_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            app_name: "render_core".to_string(),
            staging_buffer_size_kb: 16384,
            dynamic_vertex_buffer_size_kb: 2048,
            dynamic_index_buffer_size_kb: 4096,
            dynamic_uniform_buffer_size_kb: 1024,
            desired_sample_count: 1,
            vsync: true,
            validation: cfg!(debug_assertions),
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

impl RenderConfig {
    /// Parse a configuration from TOML text, filling missing fields
    /// with defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML text
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.staging_buffer_size_kb == 0 {
            return Err(ConfigError::Invalid(
                "staging_buffer_size_kb must be non-zero".to_string(),
            ));
        }
        if self.dynamic_vertex_buffer_size_kb == 0
            || self.dynamic_index_buffer_size_kb == 0
            || self.dynamic_uniform_buffer_size_kb == 0
        {
            return Err(ConfigError::Invalid(
                "dynamic buffer sizes must be non-zero".to_string(),
            ));
        }
        if !self.desired_sample_count.is_power_of_two() || self.desired_sample_count > 64 {
            return Err(ConfigError::Invalid(format!(
                "desired_sample_count must be a power of two <= 64, got {}",
                self.desired_sample_count
            )));
        }
        Ok(())
    }

    /// Initial staging capacity in bytes
    pub fn staging_buffer_size(&self) -> u64 {
        u64::from(self.staging_buffer_size_kb) * 1024
    }

    /// Per-slot dynamic vertex capacity in bytes
    pub fn dynamic_vertex_buffer_size(&self) -> u64 {
        u64::from(self.dynamic_vertex_buffer_size_kb) * 1024
    }

    /// Per-slot dynamic index capacity in bytes
    pub fn dynamic_index_buffer_size(&self) -> u64 {
        u64::from(self.dynamic_index_buffer_size_kb) * 1024
    }

    /// Per-slot dynamic uniform capacity in bytes
    pub fn dynamic_uniform_buffer_size(&self) -> u64 {
        u64::from(self.dynamic_uniform_buffer_size_kb) * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RenderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.staging_buffer_size(), 16 * 1024 * 1024);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = RenderConfig::from_toml_str(
            r#"
            dynamic_vertex_buffer_size_kb = 8192
            vsync = false
            "#,
        )
        .unwrap();
        assert_eq!(config.dynamic_vertex_buffer_size_kb, 8192);
        assert!(!config.vsync);
        // Untouched fields keep their defaults
        assert_eq!(config.staging_buffer_size_kb, 16384);
    }

    #[test]
    fn rejects_zero_sizes_and_bad_sample_counts() {
        assert!(RenderConfig::from_toml_str("staging_buffer_size_kb = 0").is_err());
        assert!(RenderConfig::from_toml_str("desired_sample_count = 3").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = RenderConfig::default();
        let text = config.to_toml_string();
        let parsed = RenderConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.app_name, config.app_name);
        assert_eq!(parsed.desired_sample_count, config.desired_sample_count);
    }
}
