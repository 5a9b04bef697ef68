//! Tracing Infrastructure
//!
//! Structured logging through `tracing` and `tracing-subscriber`. The line
//! format comes from `application.log_format` and the level from
//! `application.log_level`; `RUST_LOG` wins over the configured level when it
//! is set.
//!
//! Application-level events are logged with target [`APP_TARGET`]. Each
//! camera worker runs inside a [`camera_span`], so every event it emits,
//! including resolver fallbacks, carries the camera's serial number.
//!
//! # Example
//! ```no_run
//! use emccd_control::{config::AppConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config, false)?;
//!
//! info!(target: logging::APP_TARGET, "Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use std::io::IsTerminal;
use tracing::{Level, Span};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Target for application-level (non-camera) events.
pub const APP_TARGET: &str = "emccd_control::app";

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, human oriented
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event, for log collectors
    Json,
}

/// Resolved subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Emit a line when a span closes, with its busy/idle time
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    pub with_thread_names: bool,
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Builds the subscriber settings from application settings.
    ///
    /// `debug` forces the DEBUG level and adds source locations and span
    /// timings. Colours are only used when stdout is a terminal and the
    /// format is not JSON.
    pub fn from_app_config(config: &AppConfig, debug: bool) -> Result<Self, String> {
        let level = if debug {
            Level::DEBUG
        } else {
            parse_log_level(&config.application.log_level)?
        };
        let format = parse_log_format(&config.application.log_format)?;

        Ok(Self {
            level,
            format,
            with_span_events: debug,
            with_file_and_line: debug,
            with_ansi: format != OutputFormat::Json && std::io::stdout().is_terminal(),
            ..Default::default()
        })
    }
}

/// Initialize tracing from application settings
pub fn init_from_config(config: &AppConfig, debug: bool) -> Result<(), String> {
    init(TracingConfig::from_app_config(config, debug)?)
}

fn already_initialized(e: impl std::fmt::Display) -> Result<(), String> {
    // Expected in tests and when several entry points initialise logging
    let message = e.to_string();
    if message.contains("a global default trace dispatcher has already been set")
        || message.contains("logging system was already initialized")
    {
        Ok(())
    } else {
        Err(format!("Failed to initialize tracing: {message}"))
    }
}

/// Installs the global subscriber.
///
/// Idempotent: a second call leaves the first subscriber in place and
/// returns Ok(()).
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_ascii_lowercase()));

    tracing_subscriber::registry()
        .with(fmt_layer(&config).with_filter(env_filter))
        .try_init()
        .or_else(already_initialized)
}

fn fmt_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let span_events = if config.with_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names)
        .with_ansi(config.with_ansi);

    match config.format {
        OutputFormat::Pretty => layer.pretty().boxed(),
        OutputFormat::Compact => layer.compact().boxed(),
        OutputFormat::Json => layer.json().boxed(),
    }
}

/// Span attributing events to one camera.
pub fn camera_span(serial: &str) -> Span {
    tracing::info_span!("camera", serial = %serial)
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

/// Parse the `log_format` setting
pub fn parse_log_format(format: &str) -> Result<OutputFormat, String> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(format!(
            "Invalid log format '{}'. Must be one of: pretty, compact, json",
            format
        )),
    }
}
