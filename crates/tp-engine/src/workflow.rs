//! Workflows as a derived view over the task store.
//!
//! A workflow has no record of its own: it is the set of tasks whose
//! [`WorkflowLink`] carries its id, chained so that task `i` depends only on
//! task `i - 1`.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use tp_bridge::EngineEvent;
use tp_context::{ContextSnapshot, SnapshotKind};
use tp_core::types::{
    workflow_tag, AgentGuidance, Priority, Task, TaskStatus, WorkflowLink, WORKFLOW_TAG,
};

use crate::engine::WorkflowEngine;
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One step of a workflow to be created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowTaskSpec {
    pub content: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Task starts in `awaiting_approval` instead of `pending`.
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub estimated_minutes: Option<f64>,
    #[serde(default)]
    pub guidance: AgentGuidance,
}

impl WorkflowTaskSpec {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_estimate(mut self, minutes: f64) -> Self {
        self.estimated_minutes = Some(minutes);
        self
    }
}

impl From<&str> for WorkflowTaskSpec {
    fn from(content: &str) -> Self {
        Self::new(content)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowCreated {
    pub workflow_id: Uuid,
    pub task_ids: Vec<Uuid>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Nothing started or finished yet.
    NotStarted,
    /// A member is in progress.
    Active,
    /// Some members are done, none is running.
    Waiting,
    Completed,
    /// Every member is terminal and at least one was cancelled.
    Abandoned,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowTaskView {
    pub id: Uuid,
    pub position: u32,
    pub content: String,
    pub status: TaskStatus,
    pub approval_required: bool,
    pub estimated_minutes: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub workflow_id: Uuid,
    pub state: WorkflowState,
    pub is_current: bool,
    pub total: usize,
    pub completed: usize,
    pub completion_ratio: f64,
    pub current_task: Option<Uuid>,
    pub next_task: Option<Uuid>,
    pub estimated_minutes: f64,
    pub tasks: Vec<WorkflowTaskView>,
}

/// Derive the aggregate state of a workflow from its members.
pub fn derive_state(members: &[&Task]) -> WorkflowState {
    if members.is_empty() {
        return WorkflowState::Abandoned;
    }
    if members.iter().all(|t| t.status == TaskStatus::Completed) {
        return WorkflowState::Completed;
    }
    if members.iter().all(|t| t.status.is_terminal()) {
        return WorkflowState::Abandoned;
    }
    if members.iter().any(|t| t.status == TaskStatus::InProgress) {
        return WorkflowState::Active;
    }
    let untouched = members
        .iter()
        .all(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::AwaitingApproval));
    if untouched {
        WorkflowState::NotStarted
    } else {
        WorkflowState::Waiting
    }
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl WorkflowEngine {
    /// Create a chained workflow and make it current. Nothing is started.
    pub async fn create_workflow(
        &mut self,
        specs: Vec<WorkflowTaskSpec>,
        analyze: bool,
    ) -> Result<WorkflowCreated> {
        if specs.is_empty() {
            return Err(EngineError::InvalidInput("a workflow needs at least one task".into()));
        }
        if let Some(pos) = specs.iter().position(|s| s.content.trim().is_empty()) {
            return Err(EngineError::InvalidInput(format!(
                "workflow task {pos} has empty content"
            )));
        }

        let workflow_id = Uuid::new_v4();
        let mut task_ids = Vec::with_capacity(specs.len());
        let mut outline = String::new();

        for (i, spec) in specs.into_iter().enumerate() {
            let mut task = Task::new(spec.content.trim());
            task.priority = spec.priority;
            task.tags = vec![WORKFLOW_TAG.to_string(), workflow_tag(workflow_id)];
            task.dependencies = task_ids.last().copied().into_iter().collect();
            task.workflow = Some(WorkflowLink {
                workflow_id,
                position: i as u32,
                approval_required: spec.approval_required,
            });
            task.guidance = spec.guidance;
            task.estimated_minutes = spec.estimated_minutes;
            if spec.approval_required {
                task.status = TaskStatus::AwaitingApproval;
            }
            outline.push_str(&format!("{}. {}\n", i + 1, task.content));
            task_ids.push(self.store.insert(task));
        }

        self.current_workflow = Some(workflow_id);
        self.context.add_context(
            workflow_id,
            ContextSnapshot::new(
                SnapshotKind::UserInput,
                format!("Workflow created with {} tasks:\n{}", task_ids.len(), outline.trim_end()),
            ),
        );

        if analyze || self.analyze_on_create {
            for id in &task_ids {
                self.analyze_in_place(*id).await?;
            }
        }

        info!(workflow_id = %workflow_id, tasks = task_ids.len(), "workflow created");
        self.bus.publish(EngineEvent::WorkflowCreated {
            workflow_id,
            task_ids: task_ids.clone(),
        });
        self.persist().await;

        let tasks = task_ids
            .iter()
            .filter_map(|id| self.store.peek(*id).cloned())
            .collect();
        Ok(WorkflowCreated {
            workflow_id,
            task_ids,
            tasks,
        })
    }

    pub fn workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus> {
        let members = self.store.by_workflow(workflow_id);
        if members.is_empty() {
            return Err(EngineError::workflow_not_found(workflow_id));
        }
        let total = members.len();
        let completed = members
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();

        Ok(WorkflowStatus {
            workflow_id,
            state: derive_state(&members),
            is_current: self.current_workflow == Some(workflow_id),
            total,
            completed,
            completion_ratio: completed as f64 / total as f64,
            current_task: members
                .iter()
                .find(|t| t.status == TaskStatus::InProgress)
                .map(|t| t.id),
            next_task: members
                .iter()
                .find(|t| t.status == TaskStatus::Pending)
                .map(|t| t.id),
            estimated_minutes: members.iter().filter_map(|t| t.estimated_minutes).sum(),
            tasks: members
                .iter()
                .map(|t| WorkflowTaskView {
                    id: t.id,
                    position: t.position().unwrap_or(0),
                    content: t.content.clone(),
                    status: t.status,
                    approval_required: t.requires_approval(),
                    estimated_minutes: t.estimated_minutes,
                })
                .collect(),
        })
    }

    /// Owned copies of a workflow's members in position order.
    pub fn workflow_members(&self, workflow_id: Uuid) -> Vec<Task> {
        self.store
            .by_workflow(workflow_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Ids of every workflow with at least one member.
    pub fn workflow_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.store.iter().filter_map(|t| t.workflow_id()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
