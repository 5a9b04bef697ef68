//! Hardware boundary.
//!
//! `andor_sdk` defines the driver contract every camera call goes through;
//! `mock` implements it in memory for tests and headless runs.

pub mod andor_sdk;
pub mod mock;
