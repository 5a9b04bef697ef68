//! Background status polling.
//!
//! The monitor periodically queues a read-only `PollStatus` command on every
//! camera's worker. Cameras that are acquiring are skipped for that cycle, and
//! a full command queue is skipped rather than waited on, so the monitor never
//! contends with a run for the device handle.

use crate::logging::APP_TARGET;
use crate::worker::StatusProbe;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Outcome of one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCycle {
    pub queued: usize,
    pub skipped_busy: usize,
    pub skipped_full: usize,
}

/// Queues one status poll per idle camera.
pub fn poll_once(probes: &[StatusProbe]) -> PollCycle {
    let mut cycle = PollCycle::default();
    for probe in probes {
        if probe.is_busy() {
            tracing::trace!(target: APP_TARGET, serial = probe.serial(), "Skipping poll while acquiring");
            cycle.skipped_busy += 1;
        } else if probe.request_poll() {
            cycle.queued += 1;
        } else {
            tracing::debug!(target: APP_TARGET, serial = probe.serial(), "Command queue full, skipping poll");
            cycle.skipped_full += 1;
        }
    }
    cycle
}

/// Handle to the running poller.
pub struct StatusMonitor {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StatusMonitor {
    /// Starts polling `probes` every `interval`.
    pub fn spawn(probes: Vec<StatusProbe>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::debug!(
                target: APP_TARGET,
                cameras = probes.len(),
                interval_ms = interval.as_millis() as u64,
                "Status monitor started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        poll_once(&probes);
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
            tracing::debug!(target: APP_TARGET, "Status monitor stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Stops the poller and waits for it to exit.
    pub async fn stop(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(target: APP_TARGET, "Status monitor task failed: {}", e);
            }
        }
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
