//! Acquisition runs.
//!
//! One [`AcquisitionRun`] drives a configured camera through N frame captures
//! (N = 1 for a snap, N = series length for a kinetic series) and collects the
//! frames into a [`FrameBuffer`]. Every frame wait is bounded by the
//! [`TimeoutPolicy`], and the device acquisition is always stopped before the
//! run returns, whatever happened in between.

use crate::camera_config::CameraConfiguration;
use crate::error::{AppResult, CameraError};
use crate::hardware::andor_sdk::{
    AcquisitionGuard, AcquisitionMode, AndorError, AndorSdk, DeviceHandle, FrameData, ReadPolicy,
};
use crate::resolver::parse_acquisition_mode;
use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What to capture in one run.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionRequest {
    pub mode: AcquisitionMode,
    pub frame_count: u32,
    /// Cycle time between frames; `None` for a single scan.
    pub interval: Option<Duration>,
    /// Exposure time per frame.
    pub exposure: Duration,
}

impl AcquisitionRequest {
    /// A single frame.
    pub fn snap(exposure: Duration) -> Self {
        Self {
            mode: AcquisitionMode::SingleScan,
            frame_count: 1,
            interval: None,
            exposure,
        }
    }

    /// A kinetic series of `frame_count` frames at `interval`.
    pub fn kinetic(frame_count: u32, interval: Duration, exposure: Duration) -> Self {
        Self {
            mode: AcquisitionMode::Kinetic,
            frame_count,
            interval: Some(interval),
            exposure,
        }
    }

    /// Derives the request implied by an applied configuration.
    pub fn from_configuration(config: &CameraConfiguration) -> AppResult<Self> {
        let exposure = seconds(config.exposure_time, "exposureTime")?;
        match parse_acquisition_mode(&config.acquisition_mode)? {
            AcquisitionMode::SingleScan => Ok(Self::snap(exposure)),
            AcquisitionMode::Kinetic => {
                let frame_count = config.series_length.ok_or(CameraError::InvalidConfig {
                    field: "seriesLength".to_string(),
                    value: "missing".to_string(),
                })?;
                let cycle_time = config.cycle_time.ok_or(CameraError::InvalidConfig {
                    field: "cycleTime".to_string(),
                    value: "missing".to_string(),
                })?;
                Ok(Self::kinetic(
                    frame_count,
                    seconds(cycle_time, "cycleTime")?,
                    exposure,
                ))
            }
        }
    }
}

fn seconds(value: f64, field: &str) -> AppResult<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| CameraError::InvalidConfig {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Bound on each frame wait: `max(minimum, multiplier x frame period)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    pub minimum: Duration,
    pub exposure_multiplier: f64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            minimum: Duration::from_secs(5),
            exposure_multiplier: 10.0,
        }
    }
}

impl TimeoutPolicy {
    /// Timeout for one frame wait of `request`.
    pub fn frame_timeout(&self, request: &AcquisitionRequest) -> Duration {
        let period = request
            .interval
            .map_or(request.exposure, |interval| interval.max(request.exposure));
        let scaled = period.as_secs_f64() * self.exposure_multiplier;
        Duration::try_from_secs_f64(scaled)
            .map_or(self.minimum, |scaled| scaled.max(self.minimum))
    }
}

/// Frames of one run, in capture order.
#[derive(Debug, Default, Clone)]
pub struct FrameBuffer {
    frames: Vec<FrameData>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a frame; every frame must have the shape of the first.
    pub fn push(&mut self, frame: FrameData) -> AppResult<()> {
        if let Some(expected) = self.frame_shape() {
            if frame.dim() != expected {
                return Err(CameraError::FrameShape {
                    expected,
                    actual: frame.dim(),
                });
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// (rows, columns) of the buffered frames.
    pub fn frame_shape(&self) -> Option<(usize, usize)> {
        self.frames.first().map(|frame| frame.dim())
    }

    pub fn frames(&self) -> &[FrameData] {
        &self.frames
    }

    /// Freezes the buffer into a stack; a kinetic run always yields a 3D series.
    pub fn into_stack(self, mode: AcquisitionMode) -> Option<FrameStack> {
        let (rows, cols) = self.frame_shape()?;
        let mut frames = self.frames;
        match mode {
            AcquisitionMode::SingleScan if frames.len() == 1 => frames.pop().map(FrameStack::Single),
            _ => {
                let count = frames.len();
                let mut pixels = Vec::with_capacity(count * rows * cols);
                // Each frame is released as soon as it is copied
                for frame in frames {
                    pixels.extend(frame.iter().copied());
                }
                Array3::from_shape_vec((count, rows, cols), pixels)
                    .ok()
                    .map(FrameStack::Series)
            }
        }
    }
}

/// Immutable frames handed to the persistence sink.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameStack {
    /// One frame (rows x columns).
    Single(Array2<u16>),
    /// A series (frames x rows x columns).
    Series(Array3<u16>),
}

impl FrameStack {
    pub fn frame_count(&self) -> usize {
        match self {
            FrameStack::Single(_) => 1,
            FrameStack::Series(series) => series.dim().0,
        }
    }

    /// (rows, columns) of each frame.
    pub fn frame_shape(&self) -> (usize, usize) {
        match self {
            FrameStack::Single(frame) => frame.dim(),
            FrameStack::Series(series) => {
                let (_, rows, cols) = series.dim();
                (rows, cols)
            }
        }
    }

    /// Pixels in storage order: frame, then row, then column.
    pub fn pixels(&self) -> Box<dyn Iterator<Item = u16> + '_> {
        match self {
            FrameStack::Single(frame) => Box::new(frame.iter().copied()),
            FrameStack::Series(series) => Box::new(series.iter().copied()),
        }
    }
}

/// Completion status of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Completed => write!(f, "Completed"),
            RunStatus::Failed(reason) => write!(f, "Failed: {reason}"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// One acquisition run on one camera.
#[derive(Debug, Clone)]
pub struct AcquisitionRun {
    pub serial: String,
    pub request: AcquisitionRequest,
    pub buffer: FrameBuffer,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A finished run plus the error that ended it early, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub run: AcquisitionRun,
    pub error: Option<CameraError>,
    /// The device faulted and can no longer be trusted.
    pub fatal: bool,
}

impl AcquisitionRun {
    pub fn new(serial: impl Into<String>, request: AcquisitionRequest) -> Self {
        Self {
            serial: serial.into(),
            request,
            buffer: FrameBuffer::new(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Runs the capture loop to completion, timeout, fault or cancellation.
    ///
    /// `stop` is checked before every frame wait. `on_frame` is called with
    /// (captured, requested) after each frame.
    pub fn execute(
        mut self,
        sdk: &Arc<dyn AndorSdk>,
        handle: DeviceHandle,
        timeout: Duration,
        stop: &watch::Receiver<bool>,
        mut on_frame: impl FnMut(usize, u32),
    ) -> RunOutcome {
        let requested = self.request.frame_count;
        tracing::info!(
            mode = ?self.request.mode,
            frames = requested,
            timeout_ms = timeout.as_millis() as u64,
            "Acquisition started"
        );

        if let Err(e) = sdk.setup_acquisition(handle, self.request.mode, requested) {
            let fatal = e.is_fatal();
            return self.finish(Some(e.into()), fatal, false);
        }
        let guard = match AcquisitionGuard::start(Arc::clone(sdk), handle) {
            Ok(guard) => guard,
            Err(e) => {
                let fatal = e.is_fatal();
                return self.finish(Some(e.into()), fatal, false);
            }
        };

        let mut error: Option<CameraError> = None;
        let mut fatal = false;
        let mut cancelled = false;

        'frames: while self.buffer.len() < requested as usize {
            if *stop.borrow() {
                tracing::info!(captured = self.buffer.len(), "Acquisition cancelled");
                cancelled = true;
                break;
            }

            if let Err(e) = sdk.wait_for_frame(handle, timeout) {
                fatal = e.is_fatal();
                error = Some(self.frame_error(e));
                break;
            }

            loop {
                match sdk.read_frame(handle, ReadPolicy::Oldest) {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.buffer.push(frame) {
                            fatal = true;
                            error = Some(e);
                            break 'frames;
                        }
                        on_frame(self.buffer.len(), requested);
                        if self.buffer.len() >= requested as usize {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        fatal = e.is_fatal();
                        error = Some(self.frame_error(e));
                        break 'frames;
                    }
                }
            }
        }

        if let Err(e) = guard.stop() {
            tracing::error!("Failed to stop acquisition: {}", e);
            if error.is_none() {
                error = Some(e.into());
                fatal = true;
            }
        }

        self.finish(error, fatal, cancelled)
    }

    fn frame_error(&self, error: AndorError) -> CameraError {
        match error {
            AndorError::Timeout { .. } => CameraError::AcquisitionTimeout {
                captured: self.buffer.len(),
                requested: self.request.frame_count,
            },
            other => other.into(),
        }
    }

    fn finish(mut self, error: Option<CameraError>, fatal: bool, cancelled: bool) -> RunOutcome {
        self.status = match (&error, cancelled) {
            (Some(e), _) => RunStatus::Failed(e.to_string()),
            (None, true) => RunStatus::Cancelled,
            (None, false) => RunStatus::Completed,
        };
        self.finished_at = Some(Utc::now());

        match &error {
            Some(e) => tracing::warn!(
                captured = self.buffer.len(),
                requested = self.request.frame_count,
                fatal,
                "Acquisition ended early: {}",
                e
            ),
            None => tracing::info!(
                captured = self.buffer.len(),
                status = %self.status,
                "Acquisition finished"
            ),
        }

        RunOutcome {
            run: self,
            error,
            fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::andor_sdk::DeviceParameter;
    use crate::hardware::mock::{MockAndorSdk, MockCameraSpec};

    fn open_mock() -> (Arc<MockAndorSdk>, Arc<dyn AndorSdk>, DeviceHandle) {
        let mock = Arc::new(MockAndorSdk::with_cameras(vec![
            MockCameraSpec::new("TEST01").with_detector(8, 6),
        ]));
        let sdk: Arc<dyn AndorSdk> = mock.clone();
        let handle = sdk.open(0).unwrap();
        sdk.set_parameter(handle, &DeviceParameter::Exposure(0.001))
            .unwrap();
        (mock, sdk, handle)
    }

    fn kinetic(frames: u32) -> AcquisitionRequest {
        AcquisitionRequest::kinetic(
            frames,
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn test_timeout_policy() {
        let policy = TimeoutPolicy::default();
        assert_eq!(
            policy.frame_timeout(&AcquisitionRequest::snap(Duration::from_millis(4))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.frame_timeout(&AcquisitionRequest::snap(Duration::from_secs(2))),
            Duration::from_secs(20)
        );
        let slow_cycle = AcquisitionRequest::kinetic(
            10,
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        assert_eq!(policy.frame_timeout(&slow_cycle), Duration::from_secs(10));
    }

    #[test]
    fn test_request_from_configuration() {
        let config = CameraConfiguration::default();
        let request = AcquisitionRequest::from_configuration(&config).unwrap();
        assert_eq!(request.mode, AcquisitionMode::Kinetic);
        assert_eq!(request.frame_count, 1000);
        assert_eq!(request.interval, Some(Duration::from_millis(40)));

        let single = CameraConfiguration {
            acquisition_mode: "single".into(),
            ..CameraConfiguration::default()
        };
        let request = AcquisitionRequest::from_configuration(&single).unwrap();
        assert_eq!(request.frame_count, 1);
        assert_eq!(request.interval, None);
    }

    #[test]
    fn test_frame_buffer_rejects_shape_change() {
        let mut buffer = FrameBuffer::new();
        buffer.push(Array2::zeros((4, 4))).unwrap();
        let err = buffer.push(Array2::zeros((1, 4))).unwrap_err();
        assert!(matches!(
            err,
            CameraError::FrameShape {
                expected: (4, 4),
                actual: (1, 4)
            }
        ));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_stack_shapes() {
        let mut buffer = FrameBuffer::new();
        buffer.push(Array2::from_elem((2, 3), 7)).unwrap();
        let single = buffer.clone().into_stack(AcquisitionMode::SingleScan).unwrap();
        assert!(matches!(single, FrameStack::Single(_)));
        assert_eq!(single.frame_shape(), (2, 3));

        buffer.push(Array2::from_elem((2, 3), 9)).unwrap();
        let series = buffer.into_stack(AcquisitionMode::Kinetic).unwrap();
        assert_eq!(series.frame_count(), 2);
        let pixels: Vec<u16> = series.pixels().collect();
        assert_eq!(&pixels[..6], &[7; 6]);
        assert_eq!(&pixels[6..], &[9; 6]);

        assert!(FrameBuffer::new()
            .into_stack(AcquisitionMode::Kinetic)
            .is_none());
    }

    #[test]
    fn test_series_keeps_row_major_order() {
        let mut buffer = FrameBuffer::new();
        buffer
            .push(Array2::from_shape_vec((2, 3), vec![0, 1, 2, 3, 4, 5]).unwrap())
            .unwrap();
        // Column-major view of the same logical layout
        let transposed = Array2::from_shape_vec((3, 2), vec![10, 13, 11, 14, 12, 15])
            .unwrap()
            .reversed_axes();
        buffer.push(transposed).unwrap();

        let series = buffer.into_stack(AcquisitionMode::Kinetic).unwrap();
        let pixels: Vec<u16> = series.pixels().collect();
        assert_eq!(pixels, vec![0, 1, 2, 3, 4, 5, 10, 11, 12, 13, 14, 15]);
        match series {
            FrameStack::Series(stack) => assert_eq!(stack[[1, 0, 2]], 12),
            other => panic!("expected a series, got {other:?}"),
        }
    }

    #[test]
    fn test_kinetic_run_completes() {
        let (mock, sdk, handle) = open_mock();
        let (_tx, rx) = watch::channel(false);
        let mut progress = Vec::new();

        let outcome = AcquisitionRun::new("TEST01", kinetic(5)).execute(
            &sdk,
            handle,
            Duration::from_secs(1),
            &rx,
            |captured, requested| progress.push((captured, requested)),
        );

        assert_eq!(outcome.run.status, RunStatus::Completed);
        assert_eq!(outcome.run.buffer.len(), 5);
        assert_eq!(outcome.run.buffer.frame_shape(), Some((6, 8)));
        assert!(outcome.error.is_none());
        assert_eq!(progress.last(), Some(&(5, 5)));
        assert!(!mock.is_acquiring(handle));
    }

    #[test]
    fn test_timeout_keeps_partial_frames() {
        let (mock, sdk, handle) = open_mock();
        mock.set_frame_limit(Some(3));
        let (_tx, rx) = watch::channel(false);

        let outcome = AcquisitionRun::new("TEST01", kinetic(10)).execute(
            &sdk,
            handle,
            Duration::from_millis(20),
            &rx,
            |_, _| {},
        );

        assert_eq!(outcome.run.buffer.len(), 3);
        assert!(matches!(
            outcome.error,
            Some(CameraError::AcquisitionTimeout {
                captured: 3,
                requested: 10
            })
        ));
        assert!(!outcome.fatal);
        assert!(matches!(outcome.run.status, RunStatus::Failed(_)));
        assert_eq!(mock.calls().last().map(String::as_str), Some("stop"));
    }

    #[test]
    fn test_cancel_before_first_wait() {
        let (mock, sdk, handle) = open_mock();
        let (_tx, rx) = watch::channel(true);

        let outcome = AcquisitionRun::new("TEST01", kinetic(10)).execute(
            &sdk,
            handle,
            Duration::from_secs(1),
            &rx,
            |_, _| {},
        );

        assert_eq!(outcome.run.status, RunStatus::Cancelled);
        assert!(outcome.run.buffer.is_empty());
        assert!(mock.calls().contains(&"stop".to_string()));
    }

    #[test]
    fn test_driver_fault_is_fatal_and_stops() {
        let (mock, sdk, handle) = open_mock();
        mock.set_fault_after_frames(Some((
            2,
            AndorError::Driver {
                code: 20013,
                message: "DRV_ACQUISITION_ERRORS".into(),
            },
        )));
        let (_tx, rx) = watch::channel(false);

        let outcome = AcquisitionRun::new("TEST01", kinetic(10)).execute(
            &sdk,
            handle,
            Duration::from_secs(1),
            &rx,
            |_, _| {},
        );

        assert!(outcome.fatal);
        assert_eq!(outcome.run.buffer.len(), 2);
        assert!(matches!(outcome.error, Some(CameraError::Driver(_))));
        assert!(!mock.is_acquiring(handle));
    }

    #[test]
    fn test_stop_failure_is_reported() {
        let (mock, sdk, handle) = open_mock();
        mock.set_next_stop_fails_with_error(Some(AndorError::Driver {
            code: 20075,
            message: "DRV_NOT_INITIALIZED".into(),
        }));
        let (_tx, rx) = watch::channel(false);

        let outcome = AcquisitionRun::new(
            "TEST01",
            AcquisitionRequest::snap(Duration::from_millis(1)),
        )
        .execute(&sdk, handle, Duration::from_secs(1), &rx, |_, _| {});

        assert_eq!(outcome.run.buffer.len(), 1);
        assert!(outcome.fatal);
        assert!(matches!(outcome.run.status, RunStatus::Failed(_)));
    }
}
