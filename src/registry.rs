//! Camera Registry
//!
//! The [`CameraRegistry`] is the single owner of every connected camera's
//! worker, keyed by serial number. All add/remove/lookup goes through it, so
//! no two code paths can race on the set of cameras.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        CameraRegistry                          │
//! │   serial ──> CameraWorkerHandle (commands, status, run claim)  │
//! ├────────────────────────────────────────────────────────────────┤
//! │   CameraWorker "X-1"      CameraWorker "X-2"       ...         │
//! │   (blocking thread)       (blocking thread)                    │
//! │   CameraSession           CameraSession                        │
//! ├────────────────────────────────────────────────────────────────┤
//! │                 AndorSdk (one handle per worker)               │
//! └────────────────────────────────────────────────────────────────┘
//!         │ WorkerEvent (shared mpsc)          ▲ StatusMonitor polls
//!         ▼                                    │ (skips busy cameras)
//!     coordinator
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use emccd_control::registry::CameraRegistry;
//! use emccd_control::worker::RunPlan;
//!
//! let mut registry = CameraRegistry::new(sdk, sink, &settings);
//! registry.connect_all().await?;
//! for serial in registry.serials() {
//!     registry.configure(&serial, store.load_or_create(&serial)?).await?;
//! }
//! let pending = registry.start_experiment(&registry.serials(), &RunPlan::default()).await?;
//! for (serial, report) in pending.wait().await {
//!     println!("{serial}: {:?}", report.map(|r| r.status));
//! }
//! registry.shutdown().await?;
//! ```

use crate::camera_config::CameraConfiguration;
use crate::config::AppConfig;
use crate::error::{AppResult, CameraError};
use crate::hardware::andor_sdk::AndorSdk;
use crate::logging::APP_TARGET;
use crate::monitor::StatusMonitor;
use crate::resolver::ResolverOptions;
use crate::session::{CameraIdentity, CameraSession, CameraStatus, ConfigureReport};
use crate::storage::FrameSink;
use crate::worker::{CameraWorkerHandle, RunPlan, RunReport, StatusProbe, WorkerContext, WorkerEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the shared worker event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Runs started by one experiment, awaiting their reports.
#[derive(Debug)]
pub struct PendingRuns {
    runs: Vec<(String, oneshot::Receiver<AppResult<RunReport>>)>,
}

impl PendingRuns {
    /// Serials of the cameras taking part.
    pub fn serials(&self) -> Vec<String> {
        self.runs.iter().map(|(serial, _)| serial.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Waits for every run and returns one result per camera, in start order.
    pub async fn wait(self) -> Vec<(String, AppResult<RunReport>)> {
        let mut reports = Vec::with_capacity(self.runs.len());
        for (serial, rx) in self.runs {
            let report = match rx.await {
                Ok(report) => report,
                Err(_) => Err(CameraError::WorkerGone(serial.clone())),
            };
            reports.push((serial, report));
        }
        reports
    }
}

/// Owner of all camera workers.
pub struct CameraRegistry {
    sdk: Arc<dyn AndorSdk>,
    options: ResolverOptions,
    context: WorkerContext,
    shutdown_timeout: Duration,
    cameras: BTreeMap<String, CameraWorkerHandle>,
    events: Option<mpsc::Receiver<WorkerEvent>>,
}

impl CameraRegistry {
    /// Creates an empty registry using the acquisition and device settings of `settings`.
    pub fn new(sdk: Arc<dyn AndorSdk>, sink: Arc<dyn FrameSink>, settings: &AppConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sdk,
            options: settings.resolver_options(),
            context: WorkerContext {
                sink,
                timeout_policy: settings.timeout_policy(),
                queue_capacity: settings.acquisition.command_queue_capacity,
                events: events_tx,
            },
            shutdown_timeout: settings.shutdown_timeout(),
            cameras: BTreeMap::new(),
            events: Some(events_rx),
        }
    }

    /// Takes the receiving end of the worker event channel. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<WorkerEvent>> {
        self.events.take()
    }

    /// Opens the camera at `index` and starts its worker.
    pub async fn connect(&mut self, index: usize) -> AppResult<CameraIdentity> {
        let sdk = Arc::clone(&self.sdk);
        let options = self.options;
        let mut session = tokio::task::spawn_blocking(move || {
            let mut session = CameraSession::new(sdk, options);
            session.connect(index).map(|_| session)
        })
        .await
        .map_err(|e| CameraError::Driver(format!("connect task failed: {e}")))??;

        let identity = session
            .identity()
            .cloned()
            .ok_or(CameraError::NotConnected)?;
        if self.cameras.contains_key(&identity.serial_number) {
            tracing::warn!(
                target: APP_TARGET,
                serial = %identity.serial_number,
                index,
                "Camera already registered under another index"
            );
            if let Err(e) = session.disconnect() {
                tracing::warn!(target: APP_TARGET, "Failed to close duplicate handle: {}", e);
            }
            return Err(CameraError::DeviceBusy(index));
        }

        let handle = CameraWorkerHandle::spawn(session, &self.context)?;
        self.cameras
            .insert(identity.serial_number.clone(), handle);
        tracing::info!(
            target: APP_TARGET,
            serial = %identity.serial_number,
            index,
            "Camera registered"
        );
        Ok(identity)
    }

    /// Connects every camera the driver enumerates. Failures are logged and skipped.
    pub async fn connect_all(&mut self) -> AppResult<Vec<CameraIdentity>> {
        let sdk = Arc::clone(&self.sdk);
        let count = tokio::task::spawn_blocking(move || sdk.camera_count())
            .await
            .map_err(|e| CameraError::Driver(format!("enumeration task failed: {e}")))??;
        tracing::info!(target: APP_TARGET, count, "Cameras detected");

        let mut connected = Vec::with_capacity(count);
        for index in 0..count {
            match self.connect(index).await {
                Ok(identity) => connected.push(identity),
                Err(e) => tracing::warn!(target: APP_TARGET, index, "Failed to connect: {}", e),
            }
        }
        Ok(connected)
    }

    pub fn get(&self, serial: &str) -> AppResult<&CameraWorkerHandle> {
        self.cameras
            .get(serial)
            .ok_or_else(|| CameraError::UnknownCamera(serial.to_string()))
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.cameras.contains_key(serial)
    }

    /// Registered serial numbers, sorted.
    pub fn serials(&self) -> Vec<String> {
        self.cameras.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Latest published status of every camera.
    pub fn statuses(&self) -> Vec<CameraStatus> {
        self.cameras.values().map(CameraWorkerHandle::status).collect()
    }

    /// Applies a configuration document to one camera.
    pub async fn configure(
        &self,
        serial: &str,
        config: CameraConfiguration,
    ) -> AppResult<ConfigureReport> {
        self.get(serial)?.configure(config).await
    }

    /// Starts one run on each camera in `serials`.
    ///
    /// Nothing is started if any camera is unknown or already acquiring. If a
    /// start still fails part way, the runs already started are cancelled and
    /// waited for before the error is returned.
    pub async fn start_experiment(&self, serials: &[String], plan: &RunPlan) -> AppResult<PendingRuns> {
        let mut targets = Vec::with_capacity(serials.len());
        for serial in serials {
            let handle = self.get(serial)?;
            if handle.is_acquiring() {
                return Err(CameraError::AlreadyAcquiring(serial.clone()));
            }
            targets.push(handle);
        }

        let mut started = PendingRuns { runs: Vec::new() };
        for handle in &targets {
            match handle.start_acquisition(plan.clone()).await {
                Ok(rx) => started.runs.push((handle.serial().to_string(), rx)),
                Err(e) => {
                    tracing::error!(
                        target: APP_TARGET,
                        serial = handle.serial(),
                        "Experiment start failed, cancelling {} started runs: {}",
                        started.len(),
                        e
                    );
                    for (serial, _) in &started.runs {
                        if let Ok(started_handle) = self.get(serial) {
                            started_handle.cancel();
                        }
                    }
                    started.wait().await;
                    return Err(e);
                }
            }
        }

        tracing::info!(target: APP_TARGET, cameras = started.len(), "Experiment started");
        Ok(started)
    }

    /// Starts an experiment and waits for every report.
    pub async fn run_experiment(
        &self,
        serials: &[String],
        plan: &RunPlan,
    ) -> AppResult<Vec<(String, AppResult<RunReport>)>> {
        Ok(self.start_experiment(serials, plan).await?.wait().await)
    }

    /// Cancels the runs of every camera in `serials`.
    pub fn cancel(&self, serials: &[String]) -> AppResult<()> {
        for serial in serials {
            self.get(serial)?.cancel();
        }
        Ok(())
    }

    /// Probes for the status monitor.
    pub fn probes(&self) -> Vec<StatusProbe> {
        self.cameras.values().map(CameraWorkerHandle::probe).collect()
    }

    /// Starts a status monitor over the cameras registered now.
    pub fn spawn_monitor(&self, interval: Duration) -> StatusMonitor {
        StatusMonitor::spawn(self.probes(), interval)
    }

    /// Shuts down one camera's worker and removes it.
    pub async fn remove(&mut self, serial: &str) -> AppResult<()> {
        let handle = self
            .cameras
            .remove(serial)
            .ok_or_else(|| CameraError::UnknownCamera(serial.to_string()))?;
        handle.shutdown(self.shutdown_timeout).await?;
        tracing::info!(target: APP_TARGET, serial, "Camera removed");
        Ok(())
    }

    /// Cancels all runs, disconnects every camera and joins its worker.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let cameras = std::mem::take(&mut self.cameras);
        for handle in cameras.values() {
            handle.cancel();
        }

        let mut errors = Vec::new();
        for (serial, handle) in cameras {
            if let Err(e) = handle.shutdown(self.shutdown_timeout).await {
                tracing::error!(target: APP_TARGET, serial = %serial, "Shutdown failed: {}", e);
                errors.push(e);
            }
        }

        if errors.is_empty() {
            tracing::info!(target: APP_TARGET, "All cameras shut down");
            Ok(())
        } else {
            Err(CameraError::ShutdownFailed(errors))
        }
    }
}
