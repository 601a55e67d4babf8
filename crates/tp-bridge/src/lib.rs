//! Notification channel between the engine and its collaborators.

pub mod event_bus;
pub mod protocol;

pub use event_bus::EventBus;
pub use protocol::{
    EngineEvent, EventEnvelope, InterventionPayload, MonitorStopReason, WorkflowSummaryPayload,
};
