//! Engine settings loaded from `nadir.toml`.
//!
//! Every section and field is optional; anything missing falls back to the
//! defaults below so a missing or partial file still yields a usable config.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::LogLevel;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Nadir Sandbox".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Presentation preference, resolved against what the surface supports.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeSetting {
    Immediate,
    Mailbox,
    #[default]
    Fifo,
    FifoRelaxed,
}

/// How per-frame command pools hand back their buffers.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResetModeSetting {
    #[default]
    ResetPool,
    ResetIndividually,
    AlwaysAllocate,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: PresentModeSetting,
    /// Requested swapchain image count; clamped to the surface limits.
    pub image_count: u32,
    /// Number of recording threads each frame provisions pools for.
    pub thread_count: usize,
    pub reset_mode: ResetModeSetting,
    /// Fence wait timeout in nanoseconds.
    pub fence_timeout_ns: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: PresentModeSetting::default(),
            image_count: 3,
            thread_count: 1,
            reset_mode: ResetModeSetting::default(),
            fence_timeout_ns: u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    pub validation: bool,
    pub log_level: LogLevel,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    /// Load `nadir.toml` from the working directory, falling back to defaults on any error.
    pub fn load() -> Self {
        Self::load_from_path("nadir.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load nadir.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path. A missing file is not an error.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.graphics.thread_count, 1);
        assert_eq!(config.graphics.fence_timeout_ns, u64::MAX);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::from_toml(
            r#"
            [window]
            width = 640

            [graphics]
            present_mode = "mailbox"
            reset_mode = "reset_individually"
            thread_count = 4

            [debug]
            log_level = "trace"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.present_mode, PresentModeSetting::Mailbox);
        assert_eq!(config.graphics.reset_mode, ResetModeSetting::ResetIndividually);
        assert_eq!(config.graphics.thread_count, 4);
        assert_eq!(config.graphics.image_count, 3);
        assert_eq!(config.debug.log_level, LogLevel::Trace);
    }

    #[test]
    fn unknown_reset_mode_is_rejected() {
        assert!(Config::from_toml("[graphics]\nreset_mode = \"sometimes\"").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from_path("definitely/not/here/nadir.toml").unwrap();
        assert_eq!(config, Config::default());
    }
}
