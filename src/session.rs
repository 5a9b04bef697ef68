//! Camera session lifecycle.
//!
//! A [`CameraSession`] owns one camera's device handle, identity, capability
//! tables and applied configuration, and enforces the lifecycle state machine.
//! Sessions are owned by exactly one worker; nothing else issues calls against
//! the handle.

use crate::camera_config::CameraConfiguration;
use crate::error::{AppResult, CameraError};
use crate::hardware::andor_sdk::{
    AndorSdk, DeviceCapabilities, DeviceHandle, DeviceParameter, ParameterKind,
    TemperatureReading,
};
use crate::resolver::{self, Resolution, ResolutionWarning, ResolverOptions};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Camera session state.
///
/// # State Machine
///
/// ```text
/// Disconnected ──connect──> Connected ──configure──> Configuring ──ok──> Configured
///                               ▲                        │                │   ▲
///                               │                     fails          start│   │stop
///                               │                        ▼                ▼   │
///                               │               ConfigurationFailed    Acquiring
///                               │                        │                │
///                               └────── configure ───────┘     device fault
///                                                                         ▼
///   any state ──disconnect──> Disconnected                              Error
/// ```
///
/// A driver fault while configuring also lands in `Error`; only a rejected
/// value leads to `ConfigurationFailed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// No device handle held
    #[default]
    Disconnected,
    /// Device open, identity known, not configured
    Connected,
    /// Configuration operations being applied
    Configuring,
    /// Configuration applied successfully
    Configured,
    /// Last configuration attempt failed
    ConfigurationFailed,
    /// An acquisition run is in progress
    Acquiring,
    /// Unexpected device fault; requires disconnect and reconnect
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Configuring => write!(f, "Configuring"),
            SessionState::Configured => write!(f, "Configured"),
            SessionState::ConfigurationFailed => write!(f, "ConfigurationFailed"),
            SessionState::Acquiring => write!(f, "Acquiring"),
            SessionState::Error => write!(f, "Error"),
        }
    }
}

impl SessionState {
    /// Check if the state allows applying a configuration.
    pub fn can_configure(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Configured | SessionState::ConfigurationFailed
        )
    }

    /// Check if the state allows starting an acquisition.
    pub fn can_acquire(&self) -> bool {
        matches!(self, SessionState::Configured)
    }

    /// Whether a device handle is held in this state.
    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }
}

/// Identity captured at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraIdentity {
    /// Unique key for the camera.
    pub serial_number: String,
    pub head_model: String,
    pub controller_mode: String,
    /// Enumeration index; not stable across sessions.
    pub device_index: usize,
}

/// Why the last configuration attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFailure {
    /// Operation name, or `"validation"` when no device call was made.
    pub stage: String,
    pub cause: String,
}

/// Result of a successful `configure`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureReport {
    pub operations_applied: usize,
    pub warnings: Vec<ResolutionWarning>,
}

impl ConfigureReport {
    /// True when the resolver had to fall back for any setting.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Snapshot of a camera's state for display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraStatus {
    pub state: SessionState,
    pub identity: Option<CameraIdentity>,
    pub degraded: bool,
    pub warnings: Vec<String>,
    pub last_failure: Option<ConfigFailure>,
    pub last_error: Option<String>,
    pub temperature: Option<TemperatureReading>,
    /// Exposure read back from the device, in seconds.
    pub exposure: Option<f64>,
    /// EM gain read back from the device.
    pub em_gain: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One camera's session.
pub struct CameraSession {
    sdk: Arc<dyn AndorSdk>,
    options: ResolverOptions,
    state: SessionState,
    handle: Option<DeviceHandle>,
    identity: Option<CameraIdentity>,
    capabilities: Option<DeviceCapabilities>,
    configuration: Option<CameraConfiguration>,
    resolution: Option<Resolution>,
    last_failure: Option<ConfigFailure>,
    last_error: Option<String>,
    temperature: Option<TemperatureReading>,
    exposure: Option<f64>,
    em_gain: Option<u32>,
    updated_at: Option<DateTime<Utc>>,
}

impl CameraSession {
    pub fn new(sdk: Arc<dyn AndorSdk>, options: ResolverOptions) -> Self {
        Self {
            sdk,
            options,
            state: SessionState::Disconnected,
            handle: None,
            identity: None,
            capabilities: None,
            configuration: None,
            resolution: None,
            last_failure: None,
            last_error: None,
            temperature: None,
            exposure: None,
            em_gain: None,
            updated_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&CameraIdentity> {
        self.identity.as_ref()
    }

    /// Serial number of the connected camera.
    pub fn serial(&self) -> Option<&str> {
        self.identity.as_ref().map(|id| id.serial_number.as_str())
    }

    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.capabilities.as_ref()
    }

    /// The configuration currently applied, if the session is configured.
    pub fn configuration(&self) -> Option<&CameraConfiguration> {
        self.configuration.as_ref()
    }

    pub fn last_failure(&self) -> Option<&ConfigFailure> {
        self.last_failure.as_ref()
    }

    /// True when the applied configuration used a fallback.
    pub fn is_degraded(&self) -> bool {
        self.resolution
            .as_ref()
            .is_some_and(Resolution::is_degraded)
    }

    /// The open device handle.
    pub fn handle(&self) -> AppResult<DeviceHandle> {
        self.handle.ok_or(CameraError::NotConnected)
    }

    /// The driver this session talks to.
    pub fn sdk(&self) -> Arc<dyn AndorSdk> {
        Arc::clone(&self.sdk)
    }

    /// Opens the camera at `index` and reads its identity and capabilities.
    ///
    /// On failure the session stays `Disconnected` and any half-opened handle
    /// is closed again.
    pub fn connect(&mut self, index: usize) -> AppResult<CameraIdentity> {
        if self.state != SessionState::Disconnected {
            return Err(CameraError::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }

        let handle = self.sdk.open(index)?;
        let probe = self
            .sdk
            .device_info(handle)
            .and_then(|info| Ok((info, self.sdk.capabilities(handle)?)));
        let (info, capabilities) = match probe {
            Ok(found) => found,
            Err(e) => {
                if let Err(close_err) = self.sdk.close(handle) {
                    tracing::warn!(index, "Failed to close half-opened camera: {}", close_err);
                }
                return Err(e.into());
            }
        };

        let identity = CameraIdentity {
            serial_number: info.serial_number,
            head_model: info.head_model,
            controller_mode: info.controller_mode,
            device_index: index,
        };
        tracing::info!(
            serial = %identity.serial_number,
            head_model = %identity.head_model,
            index,
            "Camera connected"
        );

        self.handle = Some(handle);
        self.identity = Some(identity.clone());
        self.capabilities = Some(capabilities);
        self.last_failure = None;
        self.last_error = None;
        self.state = SessionState::Connected;
        Ok(identity)
    }

    /// Resolves `config` against the device and applies it in canonical order.
    ///
    /// Validation errors are returned before any device call. The first
    /// failing setter aborts the rest and returns `ConfigurationFailed` with
    /// the stage recorded. A rejected value leaves the session
    /// `ConfigurationFailed`; any other driver error moves it to `Error`.
    pub fn configure(&mut self, config: CameraConfiguration) -> AppResult<ConfigureReport> {
        let handle = self.handle()?;
        if !self.state.can_configure() {
            return Err(CameraError::InvalidState {
                operation: "configure",
                state: self.state,
            });
        }
        let capabilities = self.capabilities.as_ref().ok_or(CameraError::NotConnected)?;

        self.state = SessionState::Configuring;
        self.configuration = None;
        self.resolution = None;

        let resolution = match resolver::resolve(&config, capabilities, &self.options) {
            Ok(resolution) => resolution,
            Err(e) => {
                self.record_config_failure("validation", &e);
                return Err(e);
            }
        };

        for operation in &resolution.operations {
            tracing::debug!(
                parameter = %operation.kind(),
                value = %operation.value_string(),
                "Applying"
            );
            if let Err(e) = self.sdk.set_parameter(handle, operation) {
                let stage = operation.kind().name();
                let fatal = e.is_fatal();
                let cause = CameraError::from(e);
                self.record_config_failure(stage, &cause);
                if fatal {
                    self.fail(&cause);
                }
                return Err(CameraError::ConfigurationFailed {
                    stage: stage.to_string(),
                    cause: Box::new(cause),
                });
            }
        }

        if resolution.is_degraded() {
            tracing::warn!(
                warnings = resolution.warnings.len(),
                "Configuration applied with fallbacks"
            );
        } else {
            tracing::info!("Configuration applied");
        }

        let report = ConfigureReport {
            operations_applied: resolution.operations.len(),
            warnings: resolution.warnings.clone(),
        };
        self.configuration = Some(config);
        self.resolution = Some(resolution);
        self.last_failure = None;
        self.state = SessionState::Configured;
        Ok(report)
    }

    fn record_config_failure(&mut self, stage: &str, cause: &CameraError) {
        tracing::error!(stage, "Configuration failed: {}", cause);
        self.last_failure = Some(ConfigFailure {
            stage: stage.to_string(),
            cause: cause.to_string(),
        });
        self.state = SessionState::ConfigurationFailed;
    }

    /// Marks the start of an acquisition run.
    pub fn begin_acquisition(&mut self) -> AppResult<()> {
        match self.state {
            SessionState::Configured => {
                self.state = SessionState::Acquiring;
                Ok(())
            }
            SessionState::Acquiring => Err(CameraError::AlreadyAcquiring(
                self.serial().unwrap_or_default().to_string(),
            )),
            SessionState::Disconnected => Err(CameraError::NotConnected),
            SessionState::Error => Err(CameraError::InvalidState {
                operation: "acquire",
                state: self.state,
            }),
            _ => Err(CameraError::NotConfigured),
        }
    }

    /// Marks the end of an acquisition run. A fatal fault moves the session to `Error`.
    pub fn end_acquisition(&mut self, fault: Option<&CameraError>) {
        if self.state != SessionState::Acquiring {
            return;
        }
        match fault {
            Some(error) => self.fail(error),
            None => self.state = SessionState::Configured,
        }
    }

    /// Moves the session to `Error` after an unexpected device fault.
    pub fn fail(&mut self, error: &CameraError) {
        if self.state == SessionState::Disconnected {
            return;
        }
        tracing::error!("Camera fault: {}", error);
        self.last_error = Some(error.to_string());
        self.state = SessionState::Error;
    }

    /// Closes the device. Calling this while disconnected is a no-op.
    ///
    /// The session ends up `Disconnected` even when the driver reports an
    /// error closing the handle; that error is still returned.
    pub fn disconnect(&mut self) -> AppResult<()> {
        let Some(handle) = self.handle.take() else {
            self.state = SessionState::Disconnected;
            return Ok(());
        };

        if self.state == SessionState::Acquiring {
            if let Err(e) = self.sdk.stop_acquisition(handle) {
                tracing::warn!("Failed to stop acquisition during disconnect: {}", e);
            }
        }
        let closed = self.sdk.close(handle);

        if let Some(identity) = &self.identity {
            tracing::info!(serial = %identity.serial_number, "Camera disconnected");
        }
        self.state = SessionState::Disconnected;
        self.identity = None;
        self.capabilities = None;
        self.configuration = None;
        self.resolution = None;
        self.temperature = None;
        self.exposure = None;
        self.em_gain = None;
        closed.map_err(CameraError::from)
    }

    /// Reads temperature and parameter readbacks from the device.
    ///
    /// Only reads; never changes configuration. A fatal read error moves the
    /// session to `Error`.
    pub fn poll_status(&mut self) -> CameraStatus {
        if let Some(handle) = self.handle {
            if self.state != SessionState::Error {
                if let Err(e) = self.read_status(handle) {
                    if e.is_fatal() {
                        self.fail(&e.into());
                    } else {
                        tracing::debug!("Status poll incomplete: {}", e);
                    }
                }
            }
        }
        self.status()
    }

    fn read_status(
        &mut self,
        handle: DeviceHandle,
    ) -> Result<(), crate::hardware::andor_sdk::AndorError> {
        self.temperature = Some(self.sdk.read_temperature(handle)?);
        self.exposure = match self.sdk.get_parameter(handle, ParameterKind::Exposure)? {
            Some(DeviceParameter::Exposure(seconds)) => Some(seconds),
            _ => None,
        };
        self.em_gain = match self.sdk.get_parameter(handle, ParameterKind::EmGain)? {
            Some(DeviceParameter::EmGain(gain)) => Some(gain),
            _ => None,
        };
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Current snapshot without touching the device.
    pub fn status(&self) -> CameraStatus {
        CameraStatus {
            state: self.state,
            identity: self.identity.clone(),
            degraded: self.is_degraded(),
            warnings: self
                .resolution
                .as_ref()
                .map(|r| r.warnings.iter().map(ToString::to_string).collect())
                .unwrap_or_default(),
            last_failure: self.last_failure.clone(),
            last_error: self.last_error.clone(),
            temperature: self.temperature,
            exposure: self.exposure,
            em_gain: self.em_gain,
            updated_at: self.updated_at,
        }
    }
}
