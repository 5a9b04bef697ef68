//! Per-camera configuration documents.
//!
//! A [`CameraConfiguration`] is the declarative settings document for one
//! camera. Symbolic settings (readout rate, preamp label, shutter mode, ...)
//! are stored as the strings the operator wrote; the resolver validates and
//! maps them against the connected device, so an unknown label is reported as
//! `InvalidConfig` rather than failing deserialization.
//!
//! Documents are persisted one per camera as `{serial}_config.json` by
//! [`ConfigStore`], and created with defaults on first use.

use crate::error::AppResult;
use crate::hardware::andor_sdk::AcquisitionMode;
use crate::resolver::parse_acquisition_mode;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Vertical clocking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerticalShift {
    /// Shift speed label in microseconds per row ("0.6", "1.13", "2.2", "4.33").
    pub speed_selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_voltage_amplitude: Option<String>,
}

/// Horizontal readout settings; the triple resolves to one amplifier mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalShift {
    /// e.g. "30 MHz".
    pub readout_rate: String,
    /// e.g. "Gain1".
    pub pre_amp_gain: String,
    /// "EM" or "Conventional".
    pub output_amp: String,
}

/// Electron-multiplying gain settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmGainSettings {
    pub enabled: bool,
    /// Checked against the device-reported range; never clamped.
    pub level: i64,
}

/// Configuration document for one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfiguration {
    /// "single" or "kinetic".
    pub acquisition_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_length: Option<u32>,
    /// Kinetic cycle time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulation_count: Option<u32>,
    /// "internal", "external" or "software".
    pub triggering: String,
    /// "image" or "fvb".
    pub readout_mode: String,
    /// Exposure time in seconds.
    pub exposure_time: f64,
    #[serde(deserialize_with = "deserialize_switch")]
    pub frame_transfer: bool,
    pub vertical_shift: VerticalShift,
    pub horizontal_shift: HorizontalShift,
    pub em_gain: EmGainSettings,
    /// "auto", "open" or "close".
    pub shutter: String,
    /// "full", "low" or "off".
    pub fan_level: String,
    /// Cooler setpoint in degrees Celsius.
    pub temperature_setpoint: i32,
}

impl Default for CameraConfiguration {
    fn default() -> Self {
        Self {
            acquisition_mode: "kinetic".to_string(),
            series_length: Some(1000),
            cycle_time: Some(0.04),
            accumulation_count: Some(1),
            triggering: "internal".to_string(),
            readout_mode: "image".to_string(),
            exposure_time: 0.004,
            frame_transfer: false,
            vertical_shift: VerticalShift {
                speed_selector: "0.6".to_string(),
                clock_voltage_amplitude: Some("Normal".to_string()),
            },
            horizontal_shift: HorizontalShift {
                readout_rate: "30 MHz".to_string(),
                pre_amp_gain: "Gain1".to_string(),
                output_amp: "EM".to_string(),
            },
            em_gain: EmGainSettings {
                enabled: true,
                level: 1,
            },
            shutter: "open".to_string(),
            fan_level: "full".to_string(),
            temperature_setpoint: -25,
        }
    }
}

impl CameraConfiguration {
    /// Parses a document from JSON text.
    pub fn from_json(text: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the document as pretty-printed JSON.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Whether the document asks for a kinetic series.
    pub fn is_kinetic(&self) -> bool {
        matches!(
            parse_acquisition_mode(&self.acquisition_mode),
            Ok(AcquisitionMode::Kinetic)
        )
    }
}

/// Accepts a JSON boolean or the legacy "ON"/"OFF" strings.
fn deserialize_switch<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Switch {
        Flag(bool),
        Text(String),
    }

    match Switch::deserialize(deserializer)? {
        Switch::Flag(flag) => Ok(flag),
        Switch::Text(text) => match text.to_ascii_lowercase().as_str() {
            "on" | "true" => Ok(true),
            "off" | "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected ON/OFF or a boolean, got '{other}'"
            ))),
        },
    }
}

/// Directory of per-camera configuration documents.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the documents.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `serial`.
    pub fn path_for(&self, serial: &str) -> PathBuf {
        self.dir.join(format!("{serial}_config.json"))
    }

    /// Loads the document for `serial`.
    pub fn load(&self, serial: &str) -> AppResult<CameraConfiguration> {
        let text = fs::read_to_string(self.path_for(serial))?;
        CameraConfiguration::from_json(&text)
    }

    /// Loads the document for `serial`, writing the defaults first if none exists.
    pub fn load_or_create(&self, serial: &str) -> AppResult<CameraConfiguration> {
        let path = self.path_for(serial);
        if !path.exists() {
            tracing::info!(
                serial,
                path = %path.display(),
                "No configuration found, writing defaults"
            );
            let defaults = CameraConfiguration::default();
            self.save(serial, &defaults)?;
            return Ok(defaults);
        }
        self.load(serial)
    }

    /// Writes the document for `serial`.
    pub fn save(&self, serial: &str, config: &CameraConfiguration) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(serial);
        fs::write(&path, config.to_json()?)?;
        Ok(path)
    }
}
