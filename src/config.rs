//! Application settings using Figment
//!
//! This module provides strongly-typed settings loading for the application.
//! Settings are loaded from:
//! 1. `config/emccd.toml` (optional; every section has defaults)
//! 2. Environment variables (prefixed with `EMCCD_`, sections split on `__`)
//!
//! Per-camera configuration documents are separate JSON files; see
//! [`crate::camera_config::ConfigStore`].
//!
//! # Example
//! ```no_run
//! use emccd_control::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Output directory: {}", config.storage.output_dir.display());
//! # Ok::<(), figment::Error>(())
//! ```

use crate::acquisition::TimeoutPolicy;
use crate::resolver::ResolverOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/emccd.toml";

/// Top-level application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Output and configuration directories
    pub storage: StorageConfig,
    /// Acquisition timing and queueing
    pub acquisition: AcquisitionConfig,
    /// Background status polling
    pub monitor: MonitorConfig,
    /// Device discovery
    pub devices: DevicesConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "EMCCD Control".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for FITS output files
    pub output_dir: PathBuf,
    /// Directory for `{serial}_config.json` documents
    pub config_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            config_dir: PathBuf::from("config/cameras"),
        }
    }
}

/// Acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Lower bound on every frame wait, in seconds
    #[serde(default = "default_min_frame_timeout")]
    pub min_frame_timeout_secs: f64,
    /// Frame wait bound as a multiple of the frame period
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_exposure_multiplier: f64,
    /// Capacity of each camera's command queue
    #[serde(default = "default_queue_capacity")]
    pub command_queue_capacity: usize,
    /// How long shutdown waits for each worker, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            min_frame_timeout_secs: default_min_frame_timeout(),
            timeout_exposure_multiplier: default_timeout_multiplier(),
            command_queue_capacity: default_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// Background monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Whether the status poller runs
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Poll period in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Device discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Number of cameras the simulated driver exposes
    #[serde(default = "default_simulated_cameras")]
    pub simulated_cameras: usize,
    /// Amplifier table index used when no exact match exists (device default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_amp_mode_index: Option<usize>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            simulated_cameras: default_simulated_cameras(),
            fallback_amp_mode_index: None,
        }
    }
}

// Default value functions
fn default_min_frame_timeout() -> f64 {
    5.0
}

fn default_timeout_multiplier() -> f64 {
    10.0
}

fn default_queue_capacity() -> usize {
    32
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_simulated_cameras() -> usize {
    1
}

impl AppConfig {
    /// Load settings from `config/emccd.toml` and environment variables
    ///
    /// Environment variables can override settings with prefix EMCCD_
    /// Example: EMCCD_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("EMCCD_").split("__"))
            .extract()
    }

    /// Validate settings after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if !(self.acquisition.min_frame_timeout_secs > 0.0
            && self.acquisition.min_frame_timeout_secs.is_finite())
        {
            return Err(format!(
                "Invalid min_frame_timeout_secs {}. Must be positive",
                self.acquisition.min_frame_timeout_secs
            ));
        }

        if !(self.acquisition.timeout_exposure_multiplier >= 1.0
            && self.acquisition.timeout_exposure_multiplier.is_finite())
        {
            return Err(format!(
                "Invalid timeout_exposure_multiplier {}. Must be at least 1",
                self.acquisition.timeout_exposure_multiplier
            ));
        }

        if self.acquisition.command_queue_capacity == 0 {
            return Err("command_queue_capacity must be at least 1".to_string());
        }

        if self.monitor.enabled && self.monitor.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be positive when the monitor is enabled".to_string());
        }

        Ok(())
    }

    /// Frame-wait policy derived from the acquisition section.
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            minimum: Duration::try_from_secs_f64(self.acquisition.min_frame_timeout_secs)
                .unwrap_or(TimeoutPolicy::default().minimum),
            exposure_multiplier: self.acquisition.timeout_exposure_multiplier,
        }
    }

    /// Resolver options derived from the devices section.
    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            fallback_amp_mode: self.devices.fallback_amp_mode_index,
        }
    }

    /// Monitor poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.poll_interval_ms)
    }

    /// Per-worker shutdown wait.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition.shutdown_timeout_ms)
    }
}
