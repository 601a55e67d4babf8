use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notifications the engine and the workflow monitor emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    /// A completion in the current workflow started the next pending task.
    TaskAutoProgressed {
        completed_task: Uuid,
        next_task: Uuid,
        workflow_id: Uuid,
    },
    /// The current workflow has no pending members left and all are terminal.
    WorkflowCompleted {
        workflow_id: Uuid,
        completed_task: Uuid,
    },
    WorkflowCreated {
        workflow_id: Uuid,
        task_ids: Vec<Uuid>,
    },
    InterventionSuggested(InterventionPayload),
    WorkflowSummary(WorkflowSummaryPayload),
    MonitorStopped {
        workflow_id: Uuid,
        reason: MonitorStopReason,
    },
}

impl EngineEvent {
    /// Wire name of the event (the `event` tag).
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TaskAutoProgressed { .. } => "task_auto_progressed",
            EngineEvent::WorkflowCompleted { .. } => "workflow_completed",
            EngineEvent::WorkflowCreated { .. } => "workflow_created",
            EngineEvent::InterventionSuggested(_) => "intervention_suggested",
            EngineEvent::WorkflowSummary(_) => "workflow_summary",
            EngineEvent::MonitorStopped { .. } => "monitor_stopped",
        }
    }

    pub fn workflow_id(&self) -> Uuid {
        match self {
            EngineEvent::TaskAutoProgressed { workflow_id, .. }
            | EngineEvent::WorkflowCompleted { workflow_id, .. }
            | EngineEvent::WorkflowCreated { workflow_id, .. }
            | EngineEvent::MonitorStopped { workflow_id, .. } => *workflow_id,
            EngineEvent::InterventionSuggested(p) => p.workflow_id,
            EngineEvent::WorkflowSummary(p) => p.workflow_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionPayload {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub blocked_minutes: i64,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummaryPayload {
    pub workflow_id: Uuid,
    pub task_count: usize,
    pub elapsed_minutes: f64,
    pub estimated_minutes: f64,
    /// `estimated / elapsed`; above 1.0 means faster than estimated.
    pub efficiency: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStopReason {
    Completed,
    Abandoned,
    Stopped,
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Per-bus sequence number, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}
