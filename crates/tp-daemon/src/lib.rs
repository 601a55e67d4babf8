//! Background services for taskpilot.
//!
//! - [`monitor`]: one cancellable timer per active workflow, surfacing
//!   interventions for long-blocked tasks and a summary on completion
//! - [`daemon`]: wires the monitor to the event bus and runs the periodic
//!   context cleanup
//! - [`shutdown`]: cooperative shutdown across the daemon's loops

pub mod daemon;
pub mod monitor;
pub mod shutdown;

pub use daemon::{Daemon, DaemonIntervals};
pub use monitor::{MonitorSettings, WorkflowMonitor};
pub use shutdown::{ShutdownGuard, ShutdownSignal};
