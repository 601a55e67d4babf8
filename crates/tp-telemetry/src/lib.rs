//! Logging setup shared by the taskpilot binaries.
//!
//! Everything else in the workspace logs through `tracing` macros and
//! leaves subscriber installation to the process entry point.

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, level_for_verbosity, LogFormat};
