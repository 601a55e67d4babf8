//! Task and workflow orchestration.
//!
//! [`WorkflowEngine`] owns the task store and the per-workflow context log.
//! Mutations go store -> [`resolver`] -> auto-progression -> context, and
//! every operation is also reachable as a [`Command`] through [`dispatch`].

pub mod analysis;
pub mod checkpoint;
pub mod commands;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod store;
pub mod workflow;

pub use checkpoint::{GeneratedGuidance, GuidanceReport, TaskBrief};
pub use commands::{dispatch, dispatch_json, Command, CommandError, CommandOutput};
pub use engine::{
    ArchivedSession, ClearReport, EngineSummary, Progression, SharedEngine, TransitionOutcome,
    TransitionReport, WorkflowEngine,
};
pub use error::{EngineError, Result};
pub use store::{TaskStore, TaskUpdate};
pub use workflow::{WorkflowCreated, WorkflowState, WorkflowStatus, WorkflowTaskSpec};
