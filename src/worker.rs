//! Per-camera workers.
//!
//! Each connected camera gets one [`CameraWorker`] that owns its
//! [`CameraSession`] (and therefore its device handle) and processes
//! [`WorkerCommand`]s strictly in FIFO order on a dedicated blocking thread.
//! Nothing else ever touches the handle.
//!
//! # Message Flow
//!
//! ```text
//! Coordinator                           Worker (blocking thread, camera span)
//! -----------                           -------------------------------------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel      ------>
//!                                       3. Receive command
//!                                       4. Drive session / run acquisition
//!                                       5. Publish CameraStatus (watch)
//!                                       6. Emit WorkerEvents (mpsc, lossy)
//! 7. Await oneshot receiver     <------ 8. Send response
//! ```
//!
//! Starting a run first takes the handle's run claim, so a second start
//! against a busy camera fails immediately with `AlreadyAcquiring` instead of
//! being queued. Cancellation is a `watch<bool>` the run loop checks before
//! every frame wait.

use crate::acquisition::{AcquisitionRequest, AcquisitionRun, FrameStack, RunStatus, TimeoutPolicy};
use crate::camera_config::CameraConfiguration;
use crate::error::{AppResult, CameraError};
use crate::logging::camera_span;
use crate::session::{CameraIdentity, CameraSession, CameraStatus, ConfigureReport, SessionState};
use crate::storage::{CaptureHeader, FrameSink};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// What a single run should capture and where it goes.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    /// Explicit request; `None` derives it from the applied configuration.
    pub request: Option<AcquisitionRequest>,
    /// Free-text notes written as header comments.
    pub notes: String,
    /// Output directory.
    pub destination: PathBuf,
}

/// Result of one run on one camera.
#[derive(Debug)]
pub struct RunReport {
    pub serial: String,
    pub status: RunStatus,
    pub frames_requested: u32,
    pub frames_captured: usize,
    /// The captured frames, if any.
    pub frames: Option<FrameStack>,
    /// File written by the sink, if any.
    pub saved_to: Option<PathBuf>,
    /// Error that ended the run early.
    pub error: Option<CameraError>,
    /// Error from the persistence sink.
    pub save_error: Option<CameraError>,
}

/// Commands processed by a camera worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Apply a configuration document.
    Configure {
        config: CameraConfiguration,
        response: oneshot::Sender<AppResult<ConfigureReport>>,
    },
    /// Run one acquisition. The response arrives when the run is finished
    /// and saved, or immediately if the camera cannot acquire.
    StartAcquisition {
        plan: RunPlan,
        response: oneshot::Sender<AppResult<RunReport>>,
    },
    /// Refresh temperature and readbacks. Read-only.
    PollStatus {
        response: Option<oneshot::Sender<CameraStatus>>,
    },
    /// Close the device; the worker keeps running.
    Disconnect {
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Close the device and end the worker.
    Shutdown,
}

impl WorkerCommand {
    /// Helper to create a Configure command
    pub fn configure(
        config: CameraConfiguration,
    ) -> (Self, oneshot::Receiver<AppResult<ConfigureReport>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Configure {
                config,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StartAcquisition command
    pub fn start_acquisition(plan: RunPlan) -> (Self, oneshot::Receiver<AppResult<RunReport>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartAcquisition { plan, response: tx }, rx)
    }

    /// Helper to create a PollStatus command
    pub fn poll_status() -> (Self, oneshot::Receiver<CameraStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::PollStatus { response: Some(tx) }, rx)
    }

    /// Helper to create a Disconnect command
    pub fn disconnect() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Disconnect { response: tx }, rx)
    }
}

/// Notifications from workers to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    StateChanged {
        serial: String,
        state: SessionState,
    },
    Progress {
        serial: String,
        captured: usize,
        requested: u32,
    },
    RunFinished {
        serial: String,
        status: RunStatus,
        frames: usize,
        saved_to: Option<PathBuf>,
    },
    Fault {
        serial: String,
        message: String,
    },
}

/// Shared worker settings.
#[derive(Clone)]
pub struct WorkerContext {
    pub sink: Arc<dyn FrameSink>,
    pub timeout_policy: TimeoutPolicy,
    pub queue_capacity: usize,
    pub events: mpsc::Sender<WorkerEvent>,
}

// =============================================================================
// CameraWorker - Owns one session
// =============================================================================

/// The blocking side of a camera worker.
pub struct CameraWorker {
    session: CameraSession,
    serial: String,
    sink: Arc<dyn FrameSink>,
    timeout_policy: TimeoutPolicy,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
    status: watch::Sender<CameraStatus>,
    stop: watch::Receiver<bool>,
    run_claim: Arc<AtomicBool>,
    last_state: SessionState,
}

impl CameraWorker {
    /// Processes commands until shutdown or until every sender is dropped.
    pub fn run(mut self) {
        let span = camera_span(&self.serial);
        let _enter = span.enter();
        tracing::debug!("Worker started");

        while let Some(command) = self.commands.blocking_recv() {
            match command {
                WorkerCommand::Configure { config, response } => {
                    let result = self.session.configure(config);
                    self.publish();
                    let _ = response.send(result);
                }
                WorkerCommand::StartAcquisition { plan, response } => {
                    let result = self.acquire(plan);
                    self.run_claim.store(false, Ordering::Release);
                    self.publish();
                    let _ = response.send(result);
                }
                WorkerCommand::PollStatus { response } => {
                    let status = self.session.poll_status();
                    self.publish();
                    if let Some(response) = response {
                        let _ = response.send(status);
                    }
                }
                WorkerCommand::Disconnect { response } => {
                    let result = self.session.disconnect();
                    self.publish();
                    let _ = response.send(result);
                }
                WorkerCommand::Shutdown => break,
            }
        }

        if let Err(e) = self.session.disconnect() {
            tracing::warn!("Disconnect during shutdown failed: {}", e);
        }
        self.publish();
        tracing::debug!("Worker stopped");
    }

    fn acquire(&mut self, plan: RunPlan) -> AppResult<RunReport> {
        let config = self
            .session
            .configuration()
            .cloned()
            .ok_or(CameraError::NotConfigured)?;
        let identity = self
            .session
            .identity()
            .cloned()
            .ok_or(CameraError::NotConnected)?;
        let handle = self.session.handle()?;
        let request = match plan.request {
            Some(request) => request,
            None => AcquisitionRequest::from_configuration(&config)?,
        };

        self.session.begin_acquisition()?;
        self.publish();

        let mode = request.mode;
        let timeout = self.timeout_policy.frame_timeout(&request);
        let sdk = self.session.sdk();
        let captured_at = Utc::now();
        let events = self.events.clone();
        let serial = self.serial.clone();
        let outcome = AcquisitionRun::new(&self.serial, request).execute(
            &sdk,
            handle,
            timeout,
            &self.stop,
            |captured, requested| {
                let _ = events.try_send(WorkerEvent::Progress {
                    serial: serial.clone(),
                    captured,
                    requested,
                });
            },
        );

        let fault = if outcome.fatal {
            outcome.error.as_ref()
        } else {
            None
        };
        self.session.end_acquisition(fault);
        if let Some(fault) = fault {
            self.emit(WorkerEvent::Fault {
                serial: self.serial.clone(),
                message: fault.to_string(),
            });
        }

        let run = outcome.run;
        let error = match (outcome.error, &run.status) {
            (None, RunStatus::Cancelled) => Some(CameraError::Cancelled {
                captured: run.buffer.len(),
            }),
            (error, _) => error,
        };
        let frames_requested = run.request.frame_count;
        let frames_captured = run.buffer.len();
        let frames = run.buffer.into_stack(mode);

        let mut saved_to = None;
        let mut save_error = None;
        if let Some(stack) = &frames {
            let header = CaptureHeader::for_capture(&identity, &config, captured_at, &plan.notes);
            match self
                .sink
                .save(stack, &header, &plan.destination, &self.serial)
            {
                Ok(path) => saved_to = Some(path),
                Err(e) => {
                    tracing::error!("Failed to save frames: {}", e);
                    save_error = Some(e);
                }
            }
        }

        self.emit(WorkerEvent::RunFinished {
            serial: self.serial.clone(),
            status: run.status.clone(),
            frames: frames_captured,
            saved_to: saved_to.clone(),
        });

        Ok(RunReport {
            serial: self.serial.clone(),
            status: run.status,
            frames_requested,
            frames_captured,
            frames,
            saved_to,
            error,
            save_error,
        })
    }

    fn publish(&mut self) {
        let status = self.session.status();
        if status.state != self.last_state {
            self.last_state = status.state;
            self.emit(WorkerEvent::StateChanged {
                serial: self.serial.clone(),
                state: status.state,
            });
        }
        self.status.send_replace(status);
    }

    fn emit(&self, event: WorkerEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::trace!("Dropped worker event: {}", e);
        }
    }
}

// =============================================================================
// CameraWorkerHandle - Coordinator side
// =============================================================================

/// Cheap, clonable view used by the status monitor.
#[derive(Clone)]
pub struct StatusProbe {
    serial: String,
    commands: mpsc::Sender<WorkerCommand>,
    run_claim: Arc<AtomicBool>,
}

impl StatusProbe {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// True while a run is claimed or in progress.
    pub fn is_busy(&self) -> bool {
        self.run_claim.load(Ordering::Acquire)
    }

    /// Queues a status poll without waiting. Returns false if the queue is
    /// full or the worker is gone.
    pub fn request_poll(&self) -> bool {
        self.commands
            .try_send(WorkerCommand::PollStatus { response: None })
            .is_ok()
    }
}

/// Coordinator-side handle to one camera worker.
pub struct CameraWorkerHandle {
    identity: CameraIdentity,
    commands: mpsc::Sender<WorkerCommand>,
    status: watch::Receiver<CameraStatus>,
    stop: watch::Sender<bool>,
    run_claim: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl CameraWorkerHandle {
    /// Moves a connected session onto its own worker thread.
    pub fn spawn(session: CameraSession, context: &WorkerContext) -> AppResult<Self> {
        let identity = session
            .identity()
            .cloned()
            .ok_or(CameraError::NotConnected)?;
        let (command_tx, command_rx) = mpsc::channel(context.queue_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(session.status());
        let (stop_tx, stop_rx) = watch::channel(false);
        let run_claim = Arc::new(AtomicBool::new(false));

        let worker = CameraWorker {
            serial: identity.serial_number.clone(),
            last_state: session.state(),
            session,
            sink: Arc::clone(&context.sink),
            timeout_policy: context.timeout_policy,
            commands: command_rx,
            events: context.events.clone(),
            status: status_tx,
            stop: stop_rx,
            run_claim: Arc::clone(&run_claim),
        };
        let task = tokio::task::spawn_blocking(move || worker.run());

        Ok(Self {
            identity,
            commands: command_tx,
            status: status_rx,
            stop: stop_tx,
            run_claim,
            task: Some(task),
        })
    }

    pub fn serial(&self) -> &str {
        &self.identity.serial_number
    }

    pub fn identity(&self) -> &CameraIdentity {
        &self.identity
    }

    /// Latest published status.
    pub fn status(&self) -> CameraStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status update.
    pub fn subscribe(&self) -> watch::Receiver<CameraStatus> {
        self.status.clone()
    }

    /// True while a run is claimed or in progress.
    pub fn is_acquiring(&self) -> bool {
        self.run_claim.load(Ordering::Acquire)
    }

    pub fn probe(&self) -> StatusProbe {
        StatusProbe {
            serial: self.serial().to_string(),
            commands: self.commands.clone(),
            run_claim: Arc::clone(&self.run_claim),
        }
    }

    async fn request<T>(&self, command: WorkerCommand, rx: oneshot::Receiver<T>) -> AppResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CameraError::WorkerGone(self.serial().to_string()))?;
        rx.await
            .map_err(|_| CameraError::WorkerGone(self.serial().to_string()))
    }

    /// Applies a configuration document.
    pub async fn configure(&self, config: CameraConfiguration) -> AppResult<ConfigureReport> {
        let (command, rx) = WorkerCommand::configure(config);
        self.request(command, rx).await?
    }

    /// Starts a run and returns the receiver for its report.
    ///
    /// Fails with `AlreadyAcquiring` without queueing anything if a run is
    /// already claimed on this camera.
    pub async fn start_acquisition(
        &self,
        plan: RunPlan,
    ) -> AppResult<oneshot::Receiver<AppResult<RunReport>>> {
        if self
            .run_claim
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CameraError::AlreadyAcquiring(self.serial().to_string()));
        }
        self.stop.send_replace(false);

        let (command, rx) = WorkerCommand::start_acquisition(plan);
        if self.commands.send(command).await.is_err() {
            self.run_claim.store(false, Ordering::Release);
            return Err(CameraError::WorkerGone(self.serial().to_string()));
        }
        Ok(rx)
    }

    /// Runs one acquisition and waits for its report.
    pub async fn acquire(&self, plan: RunPlan) -> AppResult<RunReport> {
        let rx = self.start_acquisition(plan).await?;
        rx.await
            .map_err(|_| CameraError::WorkerGone(self.serial().to_string()))?
    }

    /// Asks the running acquisition to stop at the next frame boundary.
    pub fn cancel(&self) {
        self.stop.send_replace(true);
    }

    /// Polls temperature and readbacks through the command queue.
    pub async fn poll_status(&self) -> AppResult<CameraStatus> {
        let (command, rx) = WorkerCommand::poll_status();
        self.request(command, rx).await
    }

    /// Closes the device; the worker stays alive.
    pub async fn disconnect(&self) -> AppResult<()> {
        let (command, rx) = WorkerCommand::disconnect();
        self.request(command, rx).await?
    }

    /// Cancels any run, closes the device and waits for the worker to exit.
    pub async fn shutdown(mut self, timeout: Duration) -> AppResult<()> {
        let serial = self.serial().to_string();
        self.cancel();
        // A closed queue means the worker already exited
        let _ = tokio::time::timeout(timeout, self.commands.send(WorkerCommand::Shutdown)).await;

        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(serial = %serial, "Worker panicked: {}", e);
                Err(CameraError::WorkerGone(serial))
            }
            Err(_) => Err(CameraError::ShutdownTimeout(serial)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::andor_sdk::{AndorError, AndorSdk};
    use crate::hardware::mock::{MockAndorSdk, MockCameraSpec};
    use crate::resolver::ResolverOptions;
    use crate::storage::FitsWriter;

    fn fast_config() -> CameraConfiguration {
        CameraConfiguration {
            series_length: Some(4),
            cycle_time: Some(0.005),
            exposure_time: 0.001,
            ..CameraConfiguration::default()
        }
    }

    fn spawn_worker(
        sdk: Arc<MockAndorSdk>,
    ) -> (CameraWorkerHandle, mpsc::Receiver<WorkerEvent>) {
        let dyn_sdk: Arc<dyn AndorSdk> = sdk;
        let mut session = CameraSession::new(dyn_sdk, ResolverOptions::default());
        session.connect(0).unwrap();
        let (events_tx, events_rx) = mpsc::channel(256);
        let context = WorkerContext {
            sink: Arc::new(FitsWriter::new()),
            timeout_policy: TimeoutPolicy {
                minimum: Duration::from_millis(100),
                exposure_multiplier: 10.0,
            },
            queue_capacity: 8,
            events: events_tx,
        };
        (CameraWorkerHandle::spawn(session, &context).unwrap(), events_rx)
    }

    fn mock() -> Arc<MockAndorSdk> {
        Arc::new(MockAndorSdk::with_cameras(vec![
            MockCameraSpec::new("W1").with_detector(8, 8),
        ]))
    }

    #[tokio::test]
    async fn test_spawn_requires_connected_session() {
        let sdk: Arc<dyn AndorSdk> = mock();
        let session = CameraSession::new(sdk, ResolverOptions::default());
        let (events, _rx) = mpsc::channel(1);
        let context = WorkerContext {
            sink: Arc::new(FitsWriter::new()),
            timeout_policy: TimeoutPolicy::default(),
            queue_capacity: 1,
            events,
        };
        assert!(matches!(
            CameraWorkerHandle::spawn(session, &context),
            Err(CameraError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_configure_and_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events) = spawn_worker(mock());

        handle.configure(fast_config()).await.unwrap();
        assert_eq!(handle.status().state, SessionState::Configured);

        let report = handle
            .acquire(RunPlan {
                request: None,
                notes: "worker test".to_string(),
                destination: dir.path().to_path_buf(),
            })
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.frames_captured, 4);
        assert_eq!(report.frames.as_ref().unwrap().frame_count(), 4);
        assert!(report.saved_to.as_ref().unwrap().exists());
        assert!(!handle.is_acquiring());
        assert_eq!(handle.status().state, SessionState::Configured);

        let mut saw_progress = false;
        let mut saw_finished = false;
        while let Ok(event) = events.try_recv() {
            match event {
                WorkerEvent::Progress { captured: 4, .. } => saw_progress = true,
                WorkerEvent::RunFinished { frames: 4, .. } => saw_finished = true,
                _ => {}
            }
        }
        assert!(saw_progress && saw_finished);

        handle.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_before_configure_is_rejected() {
        let (handle, _events) = spawn_worker(mock());
        let err = handle.acquire(RunPlan::default()).await.unwrap_err();
        assert!(matches!(err, CameraError::NotConfigured));
        assert!(!handle.is_acquiring());
        handle.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_after_device_fault_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let sdk = mock();
        let (handle, _events) = spawn_worker(sdk.clone());
        handle.configure(fast_config()).await.unwrap();

        sdk.set_fault_after_frames(Some((
            2,
            AndorError::Driver {
                code: 20013,
                message: "DRV_ACQUISITION_ERRORS".to_string(),
            },
        )));
        let plan = RunPlan {
            destination: dir.path().to_path_buf(),
            ..RunPlan::default()
        };
        let report = handle.acquire(plan.clone()).await.unwrap();
        assert_eq!(report.frames_captured, 2);
        assert_eq!(handle.status().state, SessionState::Error);

        let err = handle.acquire(plan).await.unwrap_err();
        assert!(matches!(
            err,
            CameraError::InvalidState {
                operation: "acquire",
                state: SessionState::Error
            }
        ));
        assert!(!handle.is_acquiring());
        handle.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_preserves_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events) = spawn_worker(mock());
        let mut config = fast_config();
        config.series_length = Some(1000);
        config.cycle_time = Some(0.01);
        handle.configure(config).await.unwrap();

        let rx = handle
            .start_acquisition(RunPlan {
                destination: dir.path().to_path_buf(),
                ..RunPlan::default()
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let report = rx.await.unwrap().unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(matches!(report.error, Some(CameraError::Cancelled { .. })));
        assert!(report.frames_captured > 0);
        assert!(report.frames_captured < 1000);
        assert!(report.saved_to.is_some());
        handle.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_then_poll() {
        let sdk = mock();
        let (handle, _events) = spawn_worker(sdk.clone());
        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();
        assert_eq!(sdk.open_handle_count(), 0);

        let status = handle.poll_status().await.unwrap();
        assert_eq!(status.state, SessionState::Disconnected);
        handle.shutdown(Duration::from_secs(2)).await.unwrap();
    }
}
