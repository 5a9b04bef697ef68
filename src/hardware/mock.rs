//! Simulated Andor driver.
//!
//! `MockAndorSdk` implements [`AndorSdk`] entirely in memory so the full
//! connect → configure → acquire → save path can run without hardware.
//! Frames are generated at the configured exposure/cycle cadence with a
//! bias level plus random noise.
//!
//! Fault injection hooks cover the failure paths the rest of the crate must
//! handle: busy or missing cameras, rejected setters, frame stalls that end
//! in a timeout, fatal driver errors mid-series and failing stop calls.

use super::andor_sdk::{
    AcquisitionMode, AmpMode, AndorError, AndorSdk, CoolerStatus, DeviceCapabilities,
    DeviceHandle, DeviceInfo, DeviceParameter, FrameData, ParameterKind, ReadMode, ReadPolicy,
    TemperatureReading,
};
use ndarray::Array2;
use rand::Rng;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

const AMBIENT_TEMPERATURE_C: f64 = 20.0;
const COOLING_STEP_C: f64 = 5.0;
const BIAS_LEVEL: u16 = 500;
const DEFAULT_EXPOSURE_S: f64 = 0.01;

// =============================================================================
// Camera descriptions
// =============================================================================

/// Capability tables modelled on an iXon Ultra 888.
///
/// Indices 0-7 are the EM amplifier at 30/20/10/1 MHz with two pre-amp gains
/// each; indices 8-11 are the conventional amplifier. The factory default is
/// index 8 (conventional, fastest speed, lowest gain).
pub fn ixon_capabilities() -> DeviceCapabilities {
    let mut amp_modes = Vec::new();
    for hs_speed in 0..4 {
        for preamp in 0..2 {
            amp_modes.push(AmpMode {
                channel: 0,
                output_amp: 0,
                hs_speed,
                preamp,
            });
        }
    }
    for hs_speed in 0..2 {
        for preamp in 0..2 {
            amp_modes.push(AmpMode {
                channel: 0,
                output_amp: 1,
                hs_speed,
                preamp,
            });
        }
    }

    DeviceCapabilities {
        vs_speeds: vec![0.6, 1.13, 2.2, 4.33],
        amp_modes,
        default_amp_mode: 8,
        em_gain_range: (0, 300),
        readout_overhead: Duration::from_millis(1),
        detector_size: (64, 48),
    }
}

/// Static description of one simulated camera.
#[derive(Debug, Clone)]
pub struct MockCameraSpec {
    pub serial_number: String,
    pub head_model: String,
    pub controller_mode: String,
    pub capabilities: DeviceCapabilities,
}

impl MockCameraSpec {
    pub fn new(serial_number: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            head_model: "DU888_BV".to_string(),
            controller_mode: "CCI-23".to_string(),
            capabilities: ixon_capabilities(),
        }
    }

    /// Overrides the detector size (width, height).
    pub fn with_detector(mut self, width: usize, height: usize) -> Self {
        self.capabilities.detector_size = (width, height);
        self
    }

    /// Overrides the full capability table.
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

// =============================================================================
// Internal state
// =============================================================================

struct MockAcquisition {
    started: Instant,
    interval: Duration,
    total: u32,
    produced: u32,
    buffered: VecDeque<FrameData>,
}

struct MockCameraState {
    index: usize,
    parameters: HashMap<ParameterKind, DeviceParameter>,
    temperature: f64,
    armed: Option<(AcquisitionMode, u32)>,
    acquisition: Option<MockAcquisition>,
}

impl MockCameraState {
    fn exposure(&self) -> f64 {
        match self.parameters.get(&ParameterKind::Exposure) {
            Some(DeviceParameter::Exposure(s)) => *s,
            _ => DEFAULT_EXPOSURE_S,
        }
    }

    fn frame_interval(&self, mode: AcquisitionMode) -> Duration {
        let exposure = self.exposure();
        let seconds = match (mode, self.parameters.get(&ParameterKind::KineticSeries)) {
            (AcquisitionMode::Kinetic, Some(DeviceParameter::KineticSeries { cycle_time, .. })) => {
                cycle_time.max(exposure)
            }
            _ => exposure,
        };
        Duration::from_secs_f64(seconds.max(0.0))
    }

    fn read_mode(&self) -> ReadMode {
        match self.parameters.get(&ParameterKind::ReadMode) {
            Some(DeviceParameter::ReadMode(m)) => *m,
            _ => ReadMode::Image,
        }
    }
}

#[derive(Default)]
struct MockState {
    cameras: Vec<MockCameraSpec>,
    open: HashMap<DeviceHandle, MockCameraState>,
    next_handle: i32,
    next_open_error: Option<AndorError>,
    externally_busy: HashSet<usize>,
    rejected: HashMap<ParameterKind, String>,
    frame_limit: Option<u32>,
    fault_after: Option<(u32, AndorError)>,
    next_stop_error: Option<AndorError>,
    calls: Vec<String>,
}

impl MockState {
    fn camera(&mut self, handle: DeviceHandle) -> Result<&mut MockCameraState, AndorError> {
        self.open
            .get_mut(&handle)
            .ok_or(AndorError::CameraNotOpen(handle))
    }

    fn spec(&self, handle: DeviceHandle) -> Result<&MockCameraSpec, AndorError> {
        let index = self
            .open
            .get(&handle)
            .map(|c| c.index)
            .ok_or(AndorError::CameraNotOpen(handle))?;
        self.cameras
            .get(index)
            .ok_or(AndorError::CameraNotFound(index))
    }

    fn record(&mut self, call: String) {
        self.calls.push(call);
    }
}

// =============================================================================
// MockAndorSdk - In-memory driver
// =============================================================================

/// Mock implementation of `AndorSdk` for testing and simulation.
pub struct MockAndorSdk {
    state: Mutex<MockState>,
}

impl MockAndorSdk {
    /// Creates a driver with one simulated camera.
    pub fn new() -> Self {
        Self::with_cameras(vec![MockCameraSpec::new("SIM0001")])
    }

    /// Creates a driver exposing the given cameras, in index order.
    pub fn with_cameras(cameras: Vec<MockCameraSpec>) -> Self {
        Self {
            state: Mutex::new(MockState {
                cameras,
                next_handle: 100,
                ..MockState::default()
            }),
        }
    }

    /// Creates a driver with `count` cameras named `SIM0001`, `SIM0002`, ...
    pub fn simulated(count: usize) -> Self {
        Self::with_cameras(
            (1..=count)
                .map(|i| MockCameraSpec::new(format!("SIM{i:04}")))
                .collect(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Configures the next `open()` call to fail with a specific error.
    pub fn set_next_open_fails_with_error(&self, error: Option<AndorError>) {
        self.lock().next_open_error = error;
    }

    /// Marks a camera index as held by another process.
    pub fn set_externally_busy(&self, index: usize, busy: bool) {
        let mut state = self.lock();
        if busy {
            state.externally_busy.insert(index);
        } else {
            state.externally_busy.remove(&index);
        }
    }

    /// Makes every `set_parameter` call of `kind` fail with `reason`.
    pub fn reject_parameter(&self, kind: ParameterKind, reason: impl Into<String>) {
        self.lock().rejected.insert(kind, reason.into());
    }

    /// Clears all parameter rejections.
    pub fn clear_rejections(&self) {
        self.lock().rejected.clear();
    }

    /// Stops delivering frames after `limit` frames of each acquisition.
    /// Waits past the limit end in a timeout.
    pub fn set_frame_limit(&self, limit: Option<u32>) {
        self.lock().frame_limit = limit;
    }

    /// Fails `wait_for_frame` with `error` once `frames` frames were delivered.
    pub fn set_fault_after_frames(&self, fault: Option<(u32, AndorError)>) {
        self.lock().fault_after = fault;
    }

    /// Configures the next `stop_acquisition()` call to fail.
    pub fn set_next_stop_fails_with_error(&self, error: Option<AndorError>) {
        self.lock().next_stop_error = error;
    }

    /// Driver calls made so far, e.g. `"open:0"`, `"set:exposure"`, `"stop"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of currently open handles.
    pub fn open_handle_count(&self) -> usize {
        self.lock().open.len()
    }

    /// Whether an acquisition is currently running on `handle`.
    pub fn is_acquiring(&self, handle: DeviceHandle) -> bool {
        self.lock()
            .open
            .get(&handle)
            .is_some_and(|c| c.acquisition.is_some())
    }

    fn generate_frame(width: usize, height: usize, read_mode: ReadMode, seq: u32) -> FrameData {
        let rows = match read_mode {
            ReadMode::Image => height,
            ReadMode::FullVerticalBinning => 1,
        };
        let mut rng = rand::thread_rng();
        let offset = (seq % 100) as u16;
        Array2::from_shape_fn((rows, width), |_| {
            BIAS_LEVEL + offset + rng.gen_range(0..20u16)
        })
    }
}

impl Default for MockAndorSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl AndorSdk for MockAndorSdk {
    fn camera_count(&self) -> Result<usize, AndorError> {
        Ok(self.lock().cameras.len())
    }

    fn open(&self, index: usize) -> Result<DeviceHandle, AndorError> {
        let mut state = self.lock();
        state.record(format!("open:{index}"));
        if let Some(error) = state.next_open_error.take() {
            return Err(error);
        }
        if index >= state.cameras.len() {
            return Err(AndorError::CameraNotFound(index));
        }
        if state.externally_busy.contains(&index) || state.open.values().any(|c| c.index == index)
        {
            return Err(AndorError::CameraBusy(index));
        }

        let handle = DeviceHandle(state.next_handle);
        state.next_handle += 1;
        state.open.insert(
            handle,
            MockCameraState {
                index,
                parameters: HashMap::new(),
                temperature: AMBIENT_TEMPERATURE_C,
                armed: None,
                acquisition: None,
            },
        );
        Ok(handle)
    }

    fn close(&self, handle: DeviceHandle) -> Result<(), AndorError> {
        let mut state = self.lock();
        state.record("close".to_string());
        state
            .open
            .remove(&handle)
            .map(|_| ())
            .ok_or(AndorError::CameraNotOpen(handle))
    }

    fn device_info(&self, handle: DeviceHandle) -> Result<DeviceInfo, AndorError> {
        let state = self.lock();
        let spec = state.spec(handle)?;
        Ok(DeviceInfo {
            controller_mode: spec.controller_mode.clone(),
            head_model: spec.head_model.clone(),
            serial_number: spec.serial_number.clone(),
        })
    }

    fn capabilities(&self, handle: DeviceHandle) -> Result<DeviceCapabilities, AndorError> {
        let state = self.lock();
        Ok(state.spec(handle)?.capabilities.clone())
    }

    fn set_parameter(
        &self,
        handle: DeviceHandle,
        param: &DeviceParameter,
    ) -> Result<(), AndorError> {
        let mut state = self.lock();
        let kind = param.kind();
        state.record(format!("set:{kind}"));

        let caps = state.spec(handle)?.capabilities.clone();
        let reject = |reason: String| AndorError::ParameterRejected {
            parameter: kind.name().to_string(),
            value: param.value_string(),
            reason,
        };

        if let Some(reason) = state.rejected.get(&kind) {
            return Err(reject(reason.clone()));
        }
        match param {
            DeviceParameter::AmpMode(mode) if !caps.amp_modes.contains(mode) => {
                return Err(reject("not a legal amplifier mode".to_string()));
            }
            DeviceParameter::VsSpeed(index) if *index >= caps.vs_speeds.len() => {
                return Err(reject(format!("index out of range 0..{}", caps.vs_speeds.len())));
            }
            DeviceParameter::EmGain(gain)
                if *gain < caps.em_gain_range.0 || *gain > caps.em_gain_range.1 =>
            {
                return Err(reject(format!(
                    "outside {}..={}",
                    caps.em_gain_range.0, caps.em_gain_range.1
                )));
            }
            DeviceParameter::Exposure(seconds) if *seconds <= 0.0 => {
                return Err(reject("exposure must be positive".to_string()));
            }
            _ => {}
        }

        let camera = state.camera(handle)?;
        if camera.acquisition.is_some() {
            return Err(AndorError::AcquisitionInProgress(handle));
        }
        camera.parameters.insert(kind, param.clone());
        Ok(())
    }

    fn get_parameter(
        &self,
        handle: DeviceHandle,
        kind: ParameterKind,
    ) -> Result<Option<DeviceParameter>, AndorError> {
        let mut state = self.lock();
        Ok(state.camera(handle)?.parameters.get(&kind).cloned())
    }

    fn read_temperature(&self, handle: DeviceHandle) -> Result<TemperatureReading, AndorError> {
        let mut state = self.lock();
        let camera = state.camera(handle)?;
        let setpoint = match camera.parameters.get(&ParameterKind::TemperatureSetpoint) {
            Some(DeviceParameter::TemperatureSetpoint(t)) => f64::from(*t),
            _ => {
                return Ok(TemperatureReading {
                    celsius: camera.temperature,
                    status: CoolerStatus::Off,
                })
            }
        };

        let diff = setpoint - camera.temperature;
        camera.temperature += diff.clamp(-COOLING_STEP_C, COOLING_STEP_C);
        let status = if (setpoint - camera.temperature).abs() < 0.5 {
            CoolerStatus::Stabilized
        } else if diff.abs() <= COOLING_STEP_C {
            CoolerStatus::NotStabilized
        } else {
            CoolerStatus::NotReached
        };
        Ok(TemperatureReading {
            celsius: camera.temperature,
            status,
        })
    }

    fn setup_acquisition(
        &self,
        handle: DeviceHandle,
        mode: AcquisitionMode,
        frame_count: u32,
    ) -> Result<(), AndorError> {
        let mut state = self.lock();
        state.record(format!("setup:{frame_count}"));
        let camera = state.camera(handle)?;
        if camera.acquisition.is_some() {
            return Err(AndorError::AcquisitionInProgress(handle));
        }
        camera.armed = Some((mode, frame_count));
        Ok(())
    }

    fn start_acquisition(&self, handle: DeviceHandle) -> Result<(), AndorError> {
        let mut state = self.lock();
        state.record("start".to_string());
        let camera = state.camera(handle)?;
        if camera.acquisition.is_some() {
            return Err(AndorError::AcquisitionInProgress(handle));
        }
        let (mode, total) = camera.armed.unwrap_or((AcquisitionMode::SingleScan, 1));
        camera.acquisition = Some(MockAcquisition {
            started: Instant::now(),
            interval: camera.frame_interval(mode),
            total,
            produced: 0,
            buffered: VecDeque::new(),
        });
        Ok(())
    }

    fn stop_acquisition(&self, handle: DeviceHandle) -> Result<(), AndorError> {
        let mut state = self.lock();
        state.record("stop".to_string());
        if let Some(error) = state.next_stop_error.take() {
            return Err(error);
        }
        let camera = state.camera(handle)?;
        camera
            .acquisition
            .take()
            .map(|_| ())
            .ok_or(AndorError::NotAcquiring(handle))
    }

    fn wait_for_frame(&self, handle: DeviceHandle, timeout: Duration) -> Result<(), AndorError> {
        let due = {
            let mut state = self.lock();
            let frame_limit = state.frame_limit;
            let fault_after = state.fault_after.clone();
            let camera = state.camera(handle)?;
            let acquisition = camera
                .acquisition
                .as_ref()
                .ok_or(AndorError::NotAcquiring(handle))?;

            if let Some((after, error)) = fault_after {
                if acquisition.produced >= after {
                    return Err(error);
                }
            }
            let exhausted = acquisition.produced >= acquisition.total
                || frame_limit.is_some_and(|limit| acquisition.produced >= limit);
            if exhausted {
                None
            } else {
                Some(acquisition.started + acquisition.interval * (acquisition.produced + 1))
            }
        };

        let now = Instant::now();
        let due = match due {
            Some(due) if due <= now + timeout => due,
            _ => {
                std::thread::sleep(timeout);
                return Err(AndorError::Timeout {
                    operation: format!("wait_for_frame on {handle}"),
                });
            }
        };
        std::thread::sleep(due.saturating_duration_since(now));

        let mut state = self.lock();
        let spec_size = state.spec(handle)?.capabilities.detector_size;
        let camera = state.camera(handle)?;
        let read_mode = camera.read_mode();
        let acquisition = camera
            .acquisition
            .as_mut()
            .ok_or(AndorError::NotAcquiring(handle))?;
        let frame = Self::generate_frame(spec_size.0, spec_size.1, read_mode, acquisition.produced);
        acquisition.produced += 1;
        acquisition.buffered.push_back(frame);
        Ok(())
    }

    fn read_frame(
        &self,
        handle: DeviceHandle,
        policy: ReadPolicy,
    ) -> Result<Option<FrameData>, AndorError> {
        let mut state = self.lock();
        let camera = state.camera(handle)?;
        let acquisition = camera
            .acquisition
            .as_mut()
            .ok_or(AndorError::NotAcquiring(handle))?;
        Ok(match policy {
            ReadPolicy::Oldest => acquisition.buffered.pop_front(),
            ReadPolicy::Newest => {
                let newest = acquisition.buffered.pop_back();
                acquisition.buffered.clear();
                newest
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_cycle() {
        let sdk = MockAndorSdk::simulated(2);
        assert_eq!(sdk.camera_count().unwrap(), 2);

        let handle = sdk.open(1).unwrap();
        assert_eq!(sdk.device_info(handle).unwrap().serial_number, "SIM0002");
        assert_eq!(sdk.open(1).unwrap_err(), AndorError::CameraBusy(1));
        assert_eq!(sdk.open(5).unwrap_err(), AndorError::CameraNotFound(5));

        sdk.close(handle).unwrap();
        assert_eq!(sdk.open_handle_count(), 0);
        assert_eq!(
            sdk.close(handle).unwrap_err(),
            AndorError::CameraNotOpen(handle)
        );
    }

    #[test]
    fn test_open_fails_with_injected_error() {
        let sdk = MockAndorSdk::new();
        sdk.set_next_open_fails_with_error(Some(AndorError::Driver {
            code: 20992,
            message: "DRV_NOT_AVAILABLE".into(),
        }));
        assert!(matches!(sdk.open(0), Err(AndorError::Driver { .. })));
        // Only the next call fails
        assert!(sdk.open(0).is_ok());
    }

    #[test]
    fn test_illegal_amp_mode_rejected() {
        let sdk = MockAndorSdk::new();
        let handle = sdk.open(0).unwrap();
        let bogus = AmpMode {
            channel: 3,
            output_amp: 0,
            hs_speed: 0,
            preamp: 0,
        };
        let err = sdk
            .set_parameter(handle, &DeviceParameter::AmpMode(bogus))
            .unwrap_err();
        assert!(matches!(err, AndorError::ParameterRejected { .. }));
    }

    #[test]
    fn test_kinetic_series_delivers_frames_in_order() {
        let sdk = MockAndorSdk::with_cameras(vec![MockCameraSpec::new("A").with_detector(8, 4)]);
        let handle = sdk.open(0).unwrap();
        sdk.set_parameter(handle, &DeviceParameter::Exposure(0.001))
            .unwrap();
        sdk.setup_acquisition(handle, AcquisitionMode::Kinetic, 3)
            .unwrap();
        sdk.start_acquisition(handle).unwrap();

        for _ in 0..3 {
            sdk.wait_for_frame(handle, Duration::from_secs(1)).unwrap();
            let frame = sdk.read_frame(handle, ReadPolicy::Oldest).unwrap().unwrap();
            assert_eq!(frame.dim(), (4, 8));
        }
        let err = sdk
            .wait_for_frame(handle, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, AndorError::Timeout { .. }));

        sdk.stop_acquisition(handle).unwrap();
        assert!(!sdk.is_acquiring(handle));
    }

    #[test]
    fn test_full_vertical_binning_shape() {
        let sdk = MockAndorSdk::with_cameras(vec![MockCameraSpec::new("A").with_detector(8, 4)]);
        let handle = sdk.open(0).unwrap();
        sdk.set_parameter(handle, &DeviceParameter::Exposure(0.001))
            .unwrap();
        sdk.set_parameter(
            handle,
            &DeviceParameter::ReadMode(ReadMode::FullVerticalBinning),
        )
        .unwrap();
        sdk.setup_acquisition(handle, AcquisitionMode::SingleScan, 1)
            .unwrap();
        sdk.start_acquisition(handle).unwrap();
        sdk.wait_for_frame(handle, Duration::from_secs(1)).unwrap();
        let frame = sdk.read_frame(handle, ReadPolicy::Newest).unwrap().unwrap();
        assert_eq!(frame.dim(), (1, 8));
    }

    #[test]
    fn test_setters_refused_while_acquiring() {
        let sdk = MockAndorSdk::new();
        let handle = sdk.open(0).unwrap();
        sdk.start_acquisition(handle).unwrap();
        assert_eq!(
            sdk.set_parameter(handle, &DeviceParameter::EmGain(10))
                .unwrap_err(),
            AndorError::AcquisitionInProgress(handle)
        );
    }

    #[test]
    fn test_temperature_approaches_setpoint() {
        let sdk = MockAndorSdk::new();
        let handle = sdk.open(0).unwrap();
        assert_eq!(
            sdk.read_temperature(handle).unwrap().status,
            CoolerStatus::Off
        );

        sdk.set_parameter(handle, &DeviceParameter::TemperatureSetpoint(-25))
            .unwrap();
        let first = sdk.read_temperature(handle).unwrap();
        assert_eq!(first.celsius, 15.0);
        assert_eq!(first.status, CoolerStatus::NotReached);

        let mut last = first;
        for _ in 0..20 {
            last = sdk.read_temperature(handle).unwrap();
        }
        assert_eq!(last.celsius, -25.0);
        assert_eq!(last.status, CoolerStatus::Stabilized);
    }
}
