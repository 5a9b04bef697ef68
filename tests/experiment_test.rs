//! Multi-camera experiments through the registry, using the mock driver.

use emccd_control::acquisition::{FrameStack, RunStatus};
use emccd_control::camera_config::CameraConfiguration;
use emccd_control::config::AppConfig;
use emccd_control::error::{AppResult, CameraError};
use emccd_control::hardware::mock::{MockAndorSdk, MockCameraSpec};
use emccd_control::monitor::poll_once;
use emccd_control::registry::CameraRegistry;
use emccd_control::session::SessionState;
use emccd_control::storage::{CaptureHeader, FitsWriter, FrameSink};
use emccd_control::worker::{RunPlan, WorkerEvent};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sink that records what it was handed instead of writing files.
#[derive(Default)]
struct RecordingSink {
    saves: Mutex<Vec<(String, usize, Vec<String>)>>,
}

impl RecordingSink {
    fn saves(&self) -> Vec<(String, usize, Vec<String>)> {
        self.saves.lock().unwrap().clone()
    }
}

impl FrameSink for RecordingSink {
    fn save(
        &self,
        frames: &FrameStack,
        header: &CaptureHeader,
        destination: &Path,
        serial: &str,
    ) -> AppResult<PathBuf> {
        self.saves.lock().unwrap().push((
            serial.to_string(),
            frames.frame_count(),
            header.notes().to_vec(),
        ));
        Ok(destination.join(format!("{serial}.fits")))
    }
}

fn fast_settings() -> AppConfig {
    let mut settings = AppConfig::default();
    settings.acquisition.min_frame_timeout_secs = 0.05;
    settings.acquisition.timeout_exposure_multiplier = 1.0;
    settings.acquisition.shutdown_timeout_ms = 2000;
    settings
}

fn kinetic(frames: u32, cycle_time: f64) -> CameraConfiguration {
    CameraConfiguration {
        series_length: Some(frames),
        cycle_time: Some(cycle_time),
        exposure_time: 0.001,
        ..CameraConfiguration::default()
    }
}

fn small_cameras(count: usize) -> Arc<MockAndorSdk> {
    Arc::new(MockAndorSdk::with_cameras(
        (1..=count)
            .map(|i| MockCameraSpec::new(format!("CAM{i}")).with_detector(16, 12))
            .collect(),
    ))
}

#[tokio::test]
async fn partial_kinetic_series_is_saved() {
    let sdk = small_cameras(1);
    sdk.set_frame_limit(Some(3));
    let sink = Arc::new(RecordingSink::default());
    let mut registry = CameraRegistry::new(sdk.clone(), sink.clone(), &fast_settings());
    registry.connect_all().await.unwrap();
    registry.configure("CAM1", kinetic(10, 0.005)).await.unwrap();

    let plan = RunPlan {
        notes: "partial run".to_string(),
        ..RunPlan::default()
    };
    let reports = registry
        .run_experiment(&["CAM1".to_string()], &plan)
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    let report = reports[0].1.as_ref().unwrap();
    assert_eq!(report.frames_requested, 10);
    assert_eq!(report.frames_captured, 3);
    assert_eq!(report.frames.as_ref().map(FrameStack::frame_count), Some(3));
    assert!(matches!(
        report.error,
        Some(CameraError::AcquisitionTimeout {
            captured: 3,
            requested: 10
        })
    ));
    assert!(matches!(report.status, RunStatus::Failed(_)));

    let saves = sink.saves();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].0, "CAM1");
    assert_eq!(saves[0].1, 3);
    assert_eq!(saves[0].2, vec!["partial run".to_string()]);

    // A timeout is not a device fault
    let handle = registry.get("CAM1").unwrap();
    assert_eq!(handle.status().state, SessionState::Configured);
    assert_eq!(sdk.calls().last().map(String::as_str), Some("stop"));

    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_start_is_rejected_and_first_run_completes() {
    let sdk = small_cameras(1);
    let sink = Arc::new(RecordingSink::default());
    let mut registry = CameraRegistry::new(sdk, sink.clone(), &fast_settings());
    registry.connect_all().await.unwrap();
    registry.configure("CAM1", kinetic(20, 0.005)).await.unwrap();

    let serials = vec!["CAM1".to_string()];
    let pending = registry
        .start_experiment(&serials, &RunPlan::default())
        .await
        .unwrap();

    let err = registry
        .start_experiment(&serials, &RunPlan::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CameraError::AlreadyAcquiring(ref serial) if serial == "CAM1"));

    let err = registry
        .get("CAM1")
        .unwrap()
        .start_acquisition(RunPlan::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CameraError::AlreadyAcquiring(_)));

    let reports = pending.wait().await;
    let report = reports[0].1.as_ref().unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.frames_captured, 20);
    assert!(report.error.is_none());
    assert_eq!(sink.saves().len(), 1);

    // The claim is released once the run reports
    assert!(!registry.get("CAM1").unwrap().is_acquiring());
    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn experiment_writes_one_file_per_camera() {
    let dir = tempfile::tempdir().unwrap();
    let sdk = small_cameras(3);
    let mut registry = CameraRegistry::new(sdk, Arc::new(FitsWriter::new()), &fast_settings());
    let mut events = registry.take_events().unwrap();
    registry.connect_all().await.unwrap();
    for serial in registry.serials() {
        registry.configure(&serial, kinetic(4, 0.005)).await.unwrap();
    }

    let plan = RunPlan {
        request: None,
        notes: "three cameras".to_string(),
        destination: dir.path().to_path_buf(),
    };
    let reports = registry
        .run_experiment(&registry.serials(), &plan)
        .await
        .unwrap();

    let mut paths = Vec::new();
    for (serial, report) in &reports {
        let report = report.as_ref().unwrap();
        assert_eq!(report.status, RunStatus::Completed, "{serial}");
        let path = report.saved_to.clone().unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(&format!("_{serial}.fits")));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() % 2880, 0);
        assert!(bytes.starts_with(b"SIMPLE  ="));
        paths.push(path);
    }
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3);

    let mut finished = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WorkerEvent::RunFinished { serial, frames, .. } = event {
            assert_eq!(frames, 4);
            finished.push(serial);
        }
    }
    finished.sort();
    assert_eq!(finished, vec!["CAM1", "CAM2", "CAM3"]);

    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn unconfigured_camera_reports_not_configured() {
    let sdk = small_cameras(2);
    let sink = Arc::new(RecordingSink::default());
    let mut registry = CameraRegistry::new(sdk, sink.clone(), &fast_settings());
    registry.connect_all().await.unwrap();
    registry.configure("CAM1", kinetic(2, 0.005)).await.unwrap();

    let reports = registry
        .run_experiment(&registry.serials(), &RunPlan::default())
        .await
        .unwrap();

    assert!(reports[0].1.is_ok());
    assert!(matches!(reports[1].1, Err(CameraError::NotConfigured)));
    assert_eq!(sink.saves().len(), 1);
    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn monitor_skips_acquiring_cameras() {
    let sdk = small_cameras(1);
    let mut registry =
        CameraRegistry::new(sdk, Arc::new(RecordingSink::default()), &fast_settings());
    registry.connect_all().await.unwrap();
    registry.configure("CAM1", kinetic(30, 0.005)).await.unwrap();

    let pending = registry
        .start_experiment(&["CAM1".to_string()], &RunPlan::default())
        .await
        .unwrap();
    let cycle = poll_once(&registry.probes());
    assert_eq!(cycle.skipped_busy, 1);
    assert_eq!(cycle.queued, 0);
    pending.wait().await;

    let cycle = poll_once(&registry.probes());
    assert_eq!(cycle.queued, 1);
    let status = registry.get("CAM1").unwrap().poll_status().await.unwrap();
    assert!(status.temperature.is_some());
    assert!(status.updated_at.is_some());

    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_disconnects_every_camera() {
    let sdk = small_cameras(2);
    let mut registry =
        CameraRegistry::new(sdk.clone(), Arc::new(RecordingSink::default()), &fast_settings());
    registry.connect_all().await.unwrap();
    let monitor = registry.spawn_monitor(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(50)).await;

    monitor.stop().await;
    registry.shutdown().await.unwrap();
    assert_eq!(sdk.open_handle_count(), 0);
    assert!(registry.is_empty());

    // Nothing left to shut down
    registry.shutdown().await.unwrap();
}
