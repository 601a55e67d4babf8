use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
    Paused,
    AwaitingApproval,
}

impl TaskStatus {
    /// `Completed` and `Cancelled` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Paused` is handled separately because it may only return to the
    /// status it was paused from (see [`Task::paused_from`]).
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Completed)
                | (TaskStatus::Pending, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Pending)
                | (TaskStatus::Blocked, TaskStatus::Pending)
                | (TaskStatus::AwaitingApproval, TaskStatus::Pending)
                // Any non-terminal, non-paused state can be paused
                | (TaskStatus::Pending, TaskStatus::Paused)
                | (TaskStatus::InProgress, TaskStatus::Paused)
                | (TaskStatus::Blocked, TaskStatus::Paused)
                | (TaskStatus::AwaitingApproval, TaskStatus::Paused)
                // Any non-terminal state can be cancelled
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::InProgress, TaskStatus::Cancelled)
                | (TaskStatus::Blocked, TaskStatus::Cancelled)
                | (TaskStatus::AwaitingApproval, TaskStatus::Cancelled)
                | (TaskStatus::Paused, TaskStatus::Cancelled)
        )
    }

    pub fn all() -> &'static [TaskStatus] {
        &[
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Blocked,
            TaskStatus::Cancelled,
            TaskStatus::Paused,
            TaskStatus::AwaitingApproval,
        ]
    }

    pub fn glyph(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "[ ]",
            TaskStatus::InProgress => "[~]",
            TaskStatus::Completed => "[x]",
            TaskStatus::Blocked => "[!]",
            TaskStatus::Cancelled => "[-]",
            TaskStatus::Paused => "[=]",
            TaskStatus::AwaitingApproval => "[?]",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
            TaskStatus::AwaitingApproval => "awaiting_approval",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    pub fn is_high(&self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// SubTask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: Uuid,
    pub content: String,
    pub status: SubTaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubTask {
    pub fn new(content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            status: SubTaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// HistoryEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Updated,
    StatusChanged,
    Blocked,
    Unblocked,
    AutoProgressed,
    Approved,
    Paused,
    Resumed,
    Cancelled,
    Checkpoint,
    SubtaskAdded,
    SubtaskUpdated,
    Analyzed,
}

/// Immutable record of one mutation applied to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    pub previous_status: Option<TaskStatus>,
    pub new_status: Option<TaskStatus>,
    pub notes: Option<String>,
    pub agent: String,
    pub duration_ms: Option<u64>,
}

impl HistoryEntry {
    pub fn new(action: HistoryAction, agent: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            previous_status: None,
            new_status: None,
            notes: None,
            agent: agent.into(),
            duration_ms: None,
        }
    }

    pub fn with_transition(mut self, from: TaskStatus, to: TaskStatus) -> Self {
        self.previous_status = Some(from);
        self.new_status = Some(to);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow linkage / agent guidance / analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowLink {
    pub workflow_id: Uuid,
    /// Position within the workflow (0 = first task).
    pub position: u32,
    #[serde(default)]
    pub approval_required: bool,
}

/// Free-text fields that tell an external agent how to carry out a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentGuidance {
    #[serde(default)]
    pub parent_objective: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub validation_criteria: Vec<String>,
    #[serde(default)]
    pub recovery_instructions: Option<String>,
}

impl AgentGuidance {
    pub fn is_empty(&self) -> bool {
        self.parent_objective.is_none()
            && self.instructions.is_none()
            && self.expected_output.is_none()
            && self.validation_criteria.is_empty()
            && self.recovery_instructions.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Ai,
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAnalysis {
    pub estimated_minutes: f64,
    #[serde(default)]
    pub suggested_subtasks: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub complexity: Option<String>,
    pub source: AnalysisSource,
    pub analyzed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Advisory snapshot of in-flight task context, used for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub context: String,
    /// Completed subtasks / total subtasks (0.0 when there are none).
    pub subtask_completion: f64,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub content: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub subtasks: Vec<SubTask>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub blocked_since: Option<DateTime<Utc>>,
    /// Status to restore when a paused task is resumed.
    #[serde(default)]
    pub paused_from: Option<TaskStatus>,
    #[serde(default)]
    pub workflow: Option<WorkflowLink>,
    #[serde(default)]
    pub guidance: AgentGuidance,
    #[serde(default)]
    pub estimated_minutes: Option<f64>,
    #[serde(default)]
    pub actual_minutes: Option<f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context_snapshot: Option<Checkpoint>,
    #[serde(default)]
    pub analysis: Option<TaskAnalysis>,
}

impl Task {
    pub fn new(content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            dependencies: Vec::new(),
            subtasks: Vec::new(),
            history: Vec::new(),
            priority: None,
            tags: Vec::new(),
            blocked_reason: None,
            blocked_since: None,
            paused_from: None,
            workflow: None,
            guidance: AgentGuidance::default(),
            estimated_minutes: None,
            actual_minutes: None,
            started_at: None,
            completed_at: None,
            context_snapshot: None,
            analysis: None,
        }
    }

    pub fn workflow_id(&self) -> Option<Uuid> {
        self.workflow.as_ref().map(|w| w.workflow_id)
    }

    pub fn position(&self) -> Option<u32> {
        self.workflow.as_ref().map(|w| w.position)
    }

    pub fn requires_approval(&self) -> bool {
        self.workflow.as_ref().is_some_and(|w| w.approval_required)
    }

    pub fn is_member_of(&self, workflow_id: Uuid) -> bool {
        self.workflow_id() == Some(workflow_id)
    }

    /// Append a history entry and bump `updated_at`.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.updated_at = entry.timestamp;
        self.history.push(entry);
    }

    /// Fraction of subtasks completed (0.0 when there are none).
    pub fn subtask_completion(&self) -> f64 {
        if self.subtasks.is_empty() {
            return 0.0;
        }
        let done = self
            .subtasks
            .iter()
            .filter(|s| s.status == SubTaskStatus::Completed)
            .count();
        done as f64 / self.subtasks.len() as f64
    }

    pub fn subtask_mut(&mut self, subtask_id: Uuid) -> Option<&mut SubTask> {
        self.subtasks.iter_mut().find(|s| s.id == subtask_id)
    }
}

/// Tag carried by every workflow member.
pub const WORKFLOW_TAG: &str = "workflow";

/// Per-workflow membership tag (`workflow:<id>`).
pub fn workflow_tag(workflow_id: Uuid) -> String {
    format!("{WORKFLOW_TAG}:{workflow_id}")
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

/// Full engine state as written to the persistence store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub session_id: Uuid,
    pub tasks: Vec<Task>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub auto_progression_enabled: bool,
    #[serde(default)]
    pub current_workflow_id: Option<Uuid>,
}

impl TaskState {
    pub fn empty() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            tasks: Vec::new(),
            last_updated: Utc::now(),
            auto_progression_enabled: false,
            current_workflow_id: None,
        }
    }
}

/// Archived sessions keyed by session id, for multi-session recall.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionArchive {
    #[serde(default)]
    pub sessions: BTreeMap<Uuid, TaskState>,
}

impl SessionArchive {
    pub fn insert(&mut self, state: TaskState) {
        self.sessions.insert(state.session_id, state);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
