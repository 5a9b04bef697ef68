//! # EMCCD Control Library
//!
//! Control layer for a bench of EMCCD cameras: connect, configure from a
//! per-camera JSON document, run single or kinetic acquisitions on every
//! camera at once, and write each run to a FITS file.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the `AndorSdk` driver contract plus `MockAndorSdk`.
//! - **`camera_config`**: the `CameraConfiguration` document and its on-disk store.
//! - **`resolver`**: turns a document plus device capability tables into an
//!   ordered list of device operations, with fallback warnings.
//! - **`session`**: the per-camera lifecycle state machine.
//! - **`acquisition`**: frame timeouts, frame buffers and the run loop.
//! - **`worker`**: one command queue and blocking thread per camera.
//! - **`registry`**: owner of all workers; experiment start and await.
//! - **`monitor`**: background temperature/status polling.
//! - **`storage`**: typed FITS header model and the `FitsWriter` sink.
//! - **`config`**: application settings (TOML + environment).
//! - **`logging`**: tracing initialisation and per-camera spans.
//! - **`error`**: the `CameraError` taxonomy.

pub mod acquisition;
pub mod camera_config;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod storage;
pub mod worker;
