//! Custom error types for the application.
//!
//! This module defines the primary error type, `CameraError`, for the entire application.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur between the driver and the FITS files on disk.
//!
//! ## Error Hierarchy
//!
//! `CameraError` consolidates several failure families:
//!
//! - **Connection** (`DeviceNotFound`, `DeviceBusy`, `NotConnected`): the camera could not be
//!   opened, or an operation needed an open camera and none was present. A session that fails
//!   to connect stays disconnected.
//! - **Configuration** (`InvalidConfig`, `InvalidTiming`, `DeviceRejected`,
//!   `ConfigurationFailed`): a configuration document was malformed, physically impossible, or
//!   refused by the device. `ConfigurationFailed` carries the stage at which the device refused
//!   and wraps the underlying cause.
//! - **Acquisition** (`NotConfigured`, `AlreadyAcquiring`, `AcquisitionTimeout`,
//!   `Cancelled`, `FrameShape`): problems starting or running a capture. A timeout mid-series keeps the
//!   frames captured so far.
//! - **Coordination** (`InvalidState`, `UnknownCamera`, `WorkerGone`, `ShutdownTimeout`,
//!   `ShutdownFailed`):
//!   misuse of the session state machine or of the per-camera workers.
//! - **Ambient** (`Driver`, `Io`, `Serialization`, `Settings`): wrapped errors from the
//!   driver, the filesystem, `serde_json` and `figment`.
//!
//! Driver-level failures arrive as [`AndorError`] and convert via `From`, so `?` works
//! across the gateway boundary without losing the failure kind.

use crate::hardware::andor_sdk::AndorError;
use crate::session::SessionState;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CameraError>;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("No camera found at device index {0}")]
    DeviceNotFound(usize),

    #[error("Camera at device index {0} is busy")]
    DeviceBusy(usize),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("No camera connected")]
    NotConnected,

    #[error("Invalid configuration value for '{field}': {value}")]
    InvalidConfig { field: String, value: String },

    #[error("Cycle time {cycle_time}s is shorter than the minimum {minimum}s (exposure + readout)")]
    InvalidTiming { cycle_time: f64, minimum: f64 },

    #[error("Device rejected {parameter} = {value}: {reason}")]
    DeviceRejected {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("Configuration failed at stage '{stage}': {cause}")]
    ConfigurationFailed {
        stage: String,
        #[source]
        cause: Box<CameraError>,
    },

    #[error("Camera is not configured")]
    NotConfigured,

    #[error("Camera {0} is already acquiring")]
    AlreadyAcquiring(String),

    #[error("Timed out waiting for a frame after {captured} of {requested} frames")]
    AcquisitionTimeout { captured: usize, requested: u32 },

    #[error("Acquisition cancelled after {captured} frames")]
    Cancelled { captured: usize },

    #[error("Frame shape {actual:?} does not match the series shape {expected:?}")]
    FrameShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    #[error("Worker for camera {0} is no longer running")]
    WorkerGone(String),

    #[error("Worker for camera {0} did not stop in time")]
    ShutdownTimeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] figment::Error),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<CameraError>),
}

impl From<AndorError> for CameraError {
    fn from(value: AndorError) -> Self {
        match value {
            AndorError::CameraNotFound(index) => CameraError::DeviceNotFound(index),
            AndorError::CameraBusy(index) => CameraError::DeviceBusy(index),
            AndorError::ParameterRejected {
                parameter,
                value,
                reason,
            } => CameraError::DeviceRejected {
                parameter,
                value,
                reason,
            },
            other => CameraError::Driver(other.to_string()),
        }
    }
}
