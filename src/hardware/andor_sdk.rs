// Andor SDK Trait Abstraction
// This module provides a safe, testable interface to the Andor camera driver

use ndarray::Array2;
use std::{fmt, sync::Arc, time::Duration};

/// Represents a handle to an opened camera.
/// This wraps the raw `i32` handle handed out by the driver for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub i32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single 16-bit frame as read from the camera (rows x columns).
pub type FrameData = Array2<u16>;

/// Represents possible errors that can occur during driver operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AndorError {
    #[error("No camera found at device index {0}")]
    CameraNotFound(usize),

    #[error("Camera at device index {0} is already in use")]
    CameraBusy(usize),

    #[error("Camera with handle {0} is not open")]
    CameraNotOpen(DeviceHandle),

    #[error("Parameter '{parameter}' rejected (value {value}): {reason}")]
    ParameterRejected {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Acquisition is already in progress for handle {0}")]
    AcquisitionInProgress(DeviceHandle),

    #[error("No acquisition is running for handle {0}")]
    NotAcquiring(DeviceHandle),

    #[error("Driver call failed with code {code}: {message}")]
    Driver { code: i32, message: String },
}

impl AndorError {
    /// Timeouts and parameter rejections are recoverable; everything else means
    /// the device can no longer be trusted without reconnecting.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AndorError::Timeout { .. } | AndorError::ParameterRejected { .. }
        )
    }
}

/// Identity of an opened camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Controller card model (e.g. "CCI-23").
    pub controller_mode: String,
    /// Camera head model (e.g. "DU888_BV").
    pub head_model: String,
    /// Factory serial number; unique per physical camera.
    pub serial_number: String,
}

/// One legal combination of readout channel, output amplifier, horizontal
/// shift speed and pre-amplifier gain, as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AmpMode {
    pub channel: u16,
    pub output_amp: u16,
    pub hs_speed: u16,
    pub preamp: u16,
}

impl fmt::Display for AmpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel={} oamp={} hsspeed={} preamp={}",
            self.channel, self.output_amp, self.hs_speed, self.preamp
        )
    }
}

/// Capability tables queried once at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    /// Vertical shift speeds in microseconds per row, ordered by device index.
    pub vs_speeds: Vec<f64>,
    /// Every legal amplifier mode, ordered by device index.
    pub amp_modes: Vec<AmpMode>,
    /// Index into `amp_modes` of the factory default (known-safe) mode.
    pub default_amp_mode: usize,
    /// Inclusive EM gain range.
    pub em_gain_range: (u32, u32),
    /// Per-frame readout overhead used to validate kinetic cycle times.
    pub readout_overhead: Duration,
    /// Detector size in pixels as (width, height).
    pub detector_size: (usize, usize),
}

impl DeviceCapabilities {
    /// Returns the factory default amplifier mode. An out-of-range default
    /// index falls back to the first table entry; `None` only for an empty table.
    pub fn default_amp(&self) -> Option<AmpMode> {
        self.amp_modes
            .get(self.default_amp_mode)
            .or_else(|| self.amp_modes.first())
            .copied()
    }
}

/// Cooler fan speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    Full,
    Low,
    Off,
}

/// Acquisition mode as understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// One exposure, one frame.
    SingleScan,
    /// A series of frames at a fixed cycle time.
    Kinetic,
}

/// Trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Internal,
    External,
    Software,
}

/// Readout geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Full two-dimensional image.
    Image,
    /// Every column binned into a single row.
    FullVerticalBinning,
}

/// Shutter control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutterMode {
    Auto,
    Open,
    Closed,
}

/// Which buffered frame `read_frame` should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Oldest unread frame; preserves series order.
    Oldest,
    /// Most recent frame; older unread frames are discarded.
    Newest,
}

/// A single typed device setter call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceParameter {
    FanMode(FanMode),
    AcquisitionMode(AcquisitionMode),
    KineticSeries {
        series_length: u32,
        cycle_time: f64,
        accumulations: u32,
    },
    TriggerMode(TriggerMode),
    ReadMode(ReadMode),
    /// Exposure time in seconds.
    Exposure(f64),
    EmGain(u32),
    Shutter(ShutterMode),
    FrameTransfer(bool),
    AmpMode(AmpMode),
    /// Index into `DeviceCapabilities::vs_speeds`.
    VsSpeed(usize),
    /// Cooler setpoint in degrees Celsius.
    TemperatureSetpoint(i32),
}

/// Parameter identifiers, used for readback and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    FanMode,
    AcquisitionMode,
    KineticSeries,
    TriggerMode,
    ReadMode,
    Exposure,
    EmGain,
    Shutter,
    FrameTransfer,
    AmpMode,
    VsSpeed,
    TemperatureSetpoint,
}

impl ParameterKind {
    /// Stable name used in logs and error reports.
    pub fn name(&self) -> &'static str {
        match self {
            ParameterKind::FanMode => "fan_mode",
            ParameterKind::AcquisitionMode => "acquisition_mode",
            ParameterKind::KineticSeries => "kinetic_series",
            ParameterKind::TriggerMode => "trigger_mode",
            ParameterKind::ReadMode => "read_mode",
            ParameterKind::Exposure => "exposure",
            ParameterKind::EmGain => "em_gain",
            ParameterKind::Shutter => "shutter",
            ParameterKind::FrameTransfer => "frame_transfer",
            ParameterKind::AmpMode => "amp_mode",
            ParameterKind::VsSpeed => "vs_speed",
            ParameterKind::TemperatureSetpoint => "temperature_setpoint",
        }
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl DeviceParameter {
    /// Returns the kind of this parameter.
    pub fn kind(&self) -> ParameterKind {
        match self {
            DeviceParameter::FanMode(_) => ParameterKind::FanMode,
            DeviceParameter::AcquisitionMode(_) => ParameterKind::AcquisitionMode,
            DeviceParameter::KineticSeries { .. } => ParameterKind::KineticSeries,
            DeviceParameter::TriggerMode(_) => ParameterKind::TriggerMode,
            DeviceParameter::ReadMode(_) => ParameterKind::ReadMode,
            DeviceParameter::Exposure(_) => ParameterKind::Exposure,
            DeviceParameter::EmGain(_) => ParameterKind::EmGain,
            DeviceParameter::Shutter(_) => ParameterKind::Shutter,
            DeviceParameter::FrameTransfer(_) => ParameterKind::FrameTransfer,
            DeviceParameter::AmpMode(_) => ParameterKind::AmpMode,
            DeviceParameter::VsSpeed(_) => ParameterKind::VsSpeed,
            DeviceParameter::TemperatureSetpoint(_) => ParameterKind::TemperatureSetpoint,
        }
    }

    /// Human-readable value, used when reporting a rejected setter.
    pub fn value_string(&self) -> String {
        match self {
            DeviceParameter::FanMode(v) => format!("{v:?}"),
            DeviceParameter::AcquisitionMode(v) => format!("{v:?}"),
            DeviceParameter::KineticSeries {
                series_length,
                cycle_time,
                accumulations,
            } => format!("{series_length} frames @ {cycle_time}s x{accumulations}"),
            DeviceParameter::TriggerMode(v) => format!("{v:?}"),
            DeviceParameter::ReadMode(v) => format!("{v:?}"),
            DeviceParameter::Exposure(v) => format!("{v}s"),
            DeviceParameter::EmGain(v) => v.to_string(),
            DeviceParameter::Shutter(v) => format!("{v:?}"),
            DeviceParameter::FrameTransfer(v) => v.to_string(),
            DeviceParameter::AmpMode(v) => v.to_string(),
            DeviceParameter::VsSpeed(v) => v.to_string(),
            DeviceParameter::TemperatureSetpoint(v) => format!("{v}C"),
        }
    }
}

/// Cooler state as reported with a temperature reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolerStatus {
    Off,
    NotReached,
    NotStabilized,
    Stabilized,
}

/// Sensor temperature snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureReading {
    pub celsius: f64,
    pub status: CoolerStatus,
}

/// RAII guard that stops an acquisition when dropped.
///
/// Call [`AcquisitionGuard::stop`] to observe the stop result; dropping the
/// guard without stopping logs any failure instead.
pub struct AcquisitionGuard {
    sdk: Arc<dyn AndorSdk>,
    handle: DeviceHandle,
    armed: bool,
}

impl AcquisitionGuard {
    /// Starts acquisition on `handle` and returns a guard owning the stop call.
    pub fn start(sdk: Arc<dyn AndorSdk>, handle: DeviceHandle) -> Result<Self, AndorError> {
        sdk.start_acquisition(handle)?;
        Ok(Self {
            sdk,
            handle,
            armed: true,
        })
    }

    /// Stops acquisition explicitly, returning the driver result.
    pub fn stop(mut self) -> Result<(), AndorError> {
        self.armed = false;
        self.sdk.stop_acquisition(self.handle)
    }
}

impl Drop for AcquisitionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.sdk.stop_acquisition(self.handle) {
            tracing::error!(
                "Failed to stop acquisition for handle {}: {}",
                self.handle,
                e
            );
        }
    }
}

/// Trait defining the Andor driver abstraction.
///
/// Note: All methods take `&self` to be object-safe when used with `Arc<dyn AndorSdk>`
/// in the `AcquisitionGuard`. Implementations must use internal mutability.
///
/// Calls block; async callers run them on the blocking pool.
pub trait AndorSdk: Send + Sync {
    /// Number of cameras visible to the driver.
    fn camera_count(&self) -> Result<usize, AndorError>;
    /// Opens the camera at `index`, returning a `DeviceHandle`.
    fn open(&self, index: usize) -> Result<DeviceHandle, AndorError>;
    /// Closes an opened camera.
    fn close(&self, handle: DeviceHandle) -> Result<(), AndorError>;

    /// Reads controller, head model and serial number.
    fn device_info(&self, handle: DeviceHandle) -> Result<DeviceInfo, AndorError>;
    /// Reads capability tables (vertical speeds, amplifier modes, gain range).
    fn capabilities(&self, handle: DeviceHandle) -> Result<DeviceCapabilities, AndorError>;

    /// Applies one typed setter.
    fn set_parameter(&self, handle: DeviceHandle, param: &DeviceParameter)
        -> Result<(), AndorError>;
    /// Reads back the last value applied for `kind`, if any.
    fn get_parameter(
        &self,
        handle: DeviceHandle,
        kind: ParameterKind,
    ) -> Result<Option<DeviceParameter>, AndorError>;
    /// Reads the sensor temperature.
    fn read_temperature(&self, handle: DeviceHandle) -> Result<TemperatureReading, AndorError>;

    /// Arms the device for `frame_count` frames in `mode`.
    fn setup_acquisition(
        &self,
        handle: DeviceHandle,
        mode: AcquisitionMode,
        frame_count: u32,
    ) -> Result<(), AndorError>;
    /// Starts the armed acquisition.
    ///
    /// Prefer [`AcquisitionGuard::start`], which guarantees the matching stop.
    fn start_acquisition(&self, handle: DeviceHandle) -> Result<(), AndorError>;
    /// Stops the running acquisition.
    ///
    /// This is typically called by the `AcquisitionGuard`'s `Drop` implementation.
    fn stop_acquisition(&self, handle: DeviceHandle) -> Result<(), AndorError>;
    /// Blocks until a new frame is available or `timeout` elapses.
    fn wait_for_frame(&self, handle: DeviceHandle, timeout: Duration) -> Result<(), AndorError>;
    /// Takes a buffered frame, or `None` if nothing is buffered.
    fn read_frame(
        &self,
        handle: DeviceHandle,
        policy: ReadPolicy,
    ) -> Result<Option<FrameData>, AndorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!AndorError::Timeout {
            operation: "wait".into()
        }
        .is_fatal());
        assert!(!AndorError::ParameterRejected {
            parameter: "em_gain".into(),
            value: "9000".into(),
            reason: "out of range".into()
        }
        .is_fatal());
        assert!(AndorError::CameraNotOpen(DeviceHandle(3)).is_fatal());
        assert!(AndorError::Driver {
            code: 20013,
            message: "DRV_ERROR_ACK".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_parameter_kind_names() {
        let param = DeviceParameter::KineticSeries {
            series_length: 10,
            cycle_time: 0.04,
            accumulations: 1,
        };
        assert_eq!(param.kind(), ParameterKind::KineticSeries);
        assert_eq!(param.kind().to_string(), "kinetic_series");
        assert_eq!(param.value_string(), "10 frames @ 0.04s x1");
        assert_eq!(DeviceParameter::VsSpeed(2).kind().name(), "vs_speed");
    }

    #[test]
    fn test_default_amp_out_of_range() {
        let caps = DeviceCapabilities {
            vs_speeds: vec![0.6],
            amp_modes: vec![AmpMode {
                channel: 0,
                output_amp: 0,
                hs_speed: 0,
                preamp: 0,
            }],
            default_amp_mode: 5,
            em_gain_range: (0, 300),
            readout_overhead: Duration::from_millis(1),
            detector_size: (16, 16),
        };
        assert_eq!(caps.default_amp(), Some(caps.amp_modes[0]));

        let empty = DeviceCapabilities {
            amp_modes: Vec::new(),
            ..caps
        };
        assert_eq!(empty.default_amp(), None);
    }
}
