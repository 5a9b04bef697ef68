//! CLI Entry Point for emccd_control
//!
//! Headless run loop: connects every camera the driver reports, applies each
//! camera's stored configuration document, then keeps status polling running
//! until Ctrl-C, when every camera is disconnected cleanly.
//!
//! # Usage
//!
//! ```bash
//! emccd_control            # info-level logging
//! emccd_control --debug    # debug-level logging with file/line
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use emccd_control::camera_config::ConfigStore;
use emccd_control::config::AppConfig;
use emccd_control::hardware::mock::MockAndorSdk;
use emccd_control::logging::{self, APP_TARGET};
use emccd_control::registry::CameraRegistry;
use emccd_control::storage::FitsWriter;
use emccd_control::worker::WorkerEvent;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "emccd_control")]
#[command(about = "Multi-camera EMCCD control", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = AppConfig::load().context("Failed to load settings")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid settings: {e}"))?;
    logging::init_from_config(&settings, cli.debug).map_err(|e| anyhow::anyhow!(e))?;
    info!(target: APP_TARGET, name = %settings.application.name, "Starting");

    let sdk = Arc::new(MockAndorSdk::simulated(settings.devices.simulated_cameras));
    let store = ConfigStore::new(settings.storage.config_dir.clone());
    let mut registry = CameraRegistry::new(sdk, Arc::new(FitsWriter::new()), &settings);

    if let Some(mut events) = registry.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        });
    }

    let connected = registry.connect_all().await?;
    if connected.is_empty() {
        warn!(target: APP_TARGET, "No cameras connected");
    }

    for identity in &connected {
        let serial = &identity.serial_number;
        let config = match store.load_or_create(serial) {
            Ok(config) => config,
            Err(e) => {
                error!(target: APP_TARGET, serial = %serial, "Failed to load configuration: {}", e);
                continue;
            }
        };
        match registry.configure(serial, config).await {
            Ok(report) if report.is_degraded() => warn!(
                target: APP_TARGET,
                serial = %serial,
                warnings = report.warnings.len(),
                "Configured with fallbacks"
            ),
            Ok(_) => info!(target: APP_TARGET, serial = %serial, "Configured"),
            Err(e) => error!(target: APP_TARGET, serial = %serial, "Configuration failed: {}", e),
        }
    }

    let monitor = settings
        .monitor
        .enabled
        .then(|| registry.spawn_monitor(settings.poll_interval()));

    info!(target: APP_TARGET, "Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!(target: APP_TARGET, "Shutting down");
    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    registry.shutdown().await?;
    Ok(())
}

fn log_event(event: &WorkerEvent) {
    match event {
        WorkerEvent::StateChanged { serial, state } => {
            info!(target: APP_TARGET, serial = %serial, state = %state, "State changed")
        }
        WorkerEvent::Progress {
            serial,
            captured,
            requested,
        } => tracing::debug!(target: APP_TARGET, serial = %serial, captured, requested, "Progress"),
        WorkerEvent::RunFinished {
            serial,
            status,
            frames,
            saved_to,
        } => info!(
            target: APP_TARGET,
            serial = %serial,
            status = %status,
            frames,
            saved_to = ?saved_to,
            "Run finished"
        ),
        WorkerEvent::Fault { serial, message } => {
            error!(target: APP_TARGET, serial = %serial, "Camera fault: {}", message)
        }
    }
}
