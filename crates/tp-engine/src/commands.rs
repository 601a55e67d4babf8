//! Command-style operations with success/error envelopes.
//!
//! Every public operation is reachable through [`Command`]. [`dispatch`]
//! never lets an error or a panic escape: failures become an envelope with a
//! stable `kind`, and warnings collected during the call ride along.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use tp_context::{ContextSnapshot, SnapshotKind};
use tp_core::types::{Priority, SubTaskStatus, TaskStatus};

use crate::engine::WorkflowEngine;
use crate::error::{EngineError, Result};
use crate::store::TaskUpdate;
use crate::workflow::WorkflowTaskSpec;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A workflow step given either as plain text or as a full spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkflowTaskArg {
    Content(String),
    Spec(WorkflowTaskSpec),
}

impl From<WorkflowTaskArg> for WorkflowTaskSpec {
    fn from(arg: WorkflowTaskArg) -> Self {
        match arg {
            WorkflowTaskArg::Content(content) => WorkflowTaskSpec::new(content),
            WorkflowTaskArg::Spec(spec) => spec,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Command {
    CreateTask {
        content: String,
        #[serde(default)]
        priority: Option<Priority>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        dependencies: Vec<Uuid>,
    },
    UpdateTask {
        id: Uuid,
        #[serde(flatten)]
        update: TaskUpdate,
    },
    SetStatus {
        id: Uuid,
        status: TaskStatus,
        #[serde(default)]
        notes: Option<String>,
    },
    StartTask {
        id: Uuid,
    },
    CompleteTask {
        id: Uuid,
        #[serde(default)]
        notes: Option<String>,
    },
    CancelTask {
        id: Uuid,
        #[serde(default)]
        notes: Option<String>,
    },
    PauseTask {
        id: Uuid,
    },
    ResumeTask {
        id: Uuid,
    },
    DeleteTask {
        id: Uuid,
    },
    ListTasks {
        #[serde(default)]
        status: Option<TaskStatus>,
        #[serde(default)]
        workflow_id: Option<Uuid>,
    },
    GetTask {
        id: Uuid,
    },
    Summary,
    CreateWorkflow {
        tasks: Vec<WorkflowTaskArg>,
        #[serde(default)]
        analyze: bool,
    },
    /// Defaults to the current workflow.
    WorkflowStatus {
        #[serde(default)]
        workflow_id: Option<Uuid>,
    },
    AddSubtask {
        task_id: Uuid,
        content: String,
    },
    UpdateSubtask {
        task_id: Uuid,
        subtask_id: Uuid,
        #[serde(default)]
        status: Option<SubTaskStatus>,
        #[serde(default)]
        content: Option<String>,
    },
    Analyze {
        id: Uuid,
    },
    Checkpoint {
        id: Uuid,
        note: String,
        #[serde(default)]
        environment: BTreeMap<String, String>,
    },
    /// Flips the flag when `enabled` is absent.
    ToggleAutoProgression {
        #[serde(default)]
        enabled: Option<bool>,
    },
    Approve {
        id: Uuid,
        #[serde(default)]
        notes: Option<String>,
    },
    RequestGuidance {
        id: Uuid,
    },
    GetGuidance {
        id: Uuid,
    },
    GetNextSteps {
        id: Uuid,
    },
    Clear {
        #[serde(default = "default_true")]
        archive: bool,
    },
    ListArchived,
    AddContext {
        #[serde(default)]
        workflow_id: Option<Uuid>,
        kind: SnapshotKind,
        content: String,
        #[serde(default)]
        task_id: Option<Uuid>,
        #[serde(default)]
        priority: Option<Priority>,
    },
    GetContext {
        #[serde(default)]
        workflow_id: Option<Uuid>,
        prompt: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateTask { .. } => "create_task",
            Command::UpdateTask { .. } => "update_task",
            Command::SetStatus { .. } => "set_status",
            Command::StartTask { .. } => "start_task",
            Command::CompleteTask { .. } => "complete_task",
            Command::CancelTask { .. } => "cancel_task",
            Command::PauseTask { .. } => "pause_task",
            Command::ResumeTask { .. } => "resume_task",
            Command::DeleteTask { .. } => "delete_task",
            Command::ListTasks { .. } => "list_tasks",
            Command::GetTask { .. } => "get_task",
            Command::Summary => "summary",
            Command::CreateWorkflow { .. } => "create_workflow",
            Command::WorkflowStatus { .. } => "workflow_status",
            Command::AddSubtask { .. } => "add_subtask",
            Command::UpdateSubtask { .. } => "update_subtask",
            Command::Analyze { .. } => "analyze",
            Command::Checkpoint { .. } => "checkpoint",
            Command::ToggleAutoProgression { .. } => "toggle_auto_progression",
            Command::Approve { .. } => "approve",
            Command::RequestGuidance { .. } => "request_guidance",
            Command::GetGuidance { .. } => "get_guidance",
            Command::GetNextSteps { .. } => "get_next_steps",
            Command::Clear { .. } => "clear",
            Command::ListArchived => "list_archived",
            Command::AddContext { .. } => "add_context",
            Command::GetContext { .. } => "get_context",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl CommandOutput {
    pub fn ok(data: Value, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            warnings,
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CommandError {
                kind: kind.into(),
                message: message.into(),
            }),
            warnings,
        }
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Run a command against the engine. Errors and panics become failure
/// envelopes; the engine stays usable.
pub async fn dispatch(engine: &mut WorkflowEngine, command: Command) -> CommandOutput {
    let name = command.name();
    let result = AssertUnwindSafe(execute(engine, command))
        .catch_unwind()
        .await;
    let warnings = engine.take_warnings();

    match result {
        Ok(Ok(data)) => CommandOutput::ok(data, warnings),
        Ok(Err(e)) => {
            debug!(command = name, kind = e.kind(), error = %e, "command failed");
            CommandOutput::failure(e.kind(), e.to_string(), warnings)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(command = name, %message, "command panicked");
            CommandOutput::failure(
                "internal",
                format!("internal error while handling {name}: {message}"),
                warnings,
            )
        }
    }
}

/// Parse a JSON command and dispatch it.
pub async fn dispatch_json(engine: &mut WorkflowEngine, raw: &str) -> CommandOutput {
    match serde_json::from_str::<Command>(raw) {
        Ok(command) => dispatch(engine, command).await,
        Err(e) => CommandOutput::failure("invalid_input", format!("invalid command: {e}"), Vec::new()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn workflow_or_current(engine: &WorkflowEngine, workflow_id: Option<Uuid>) -> Result<Uuid> {
    workflow_id
        .or(engine.current_workflow())
        .ok_or_else(|| EngineError::InvalidInput("no workflow id given and no current workflow".into()))
}

async fn execute(engine: &mut WorkflowEngine, command: Command) -> Result<Value> {
    let value = match command {
        Command::CreateTask {
            content,
            priority,
            tags,
            dependencies,
        } => serde_json::to_value(
            engine
                .create_task(&content, priority, tags, dependencies)
                .await?,
        )?,
        Command::UpdateTask { id, update } => serde_json::to_value(engine.update_task(id, update).await?)?,
        Command::SetStatus { id, status, notes } => {
            serde_json::to_value(engine.set_status(id, status, notes).await?)?
        }
        Command::StartTask { id } => serde_json::to_value(engine.start_task(id).await?)?,
        Command::CompleteTask { id, notes } => {
            serde_json::to_value(engine.complete_task(id, notes).await?)?
        }
        Command::CancelTask { id, notes } => serde_json::to_value(engine.cancel_task(id, notes).await?)?,
        Command::PauseTask { id } => serde_json::to_value(engine.pause_task(id).await?)?,
        Command::ResumeTask { id } => serde_json::to_value(engine.resume_task(id).await?)?,
        Command::DeleteTask { id } => {
            let removed = engine.delete_task(id).await?;
            json!({ "deleted": removed.id, "content": removed.content })
        }
        Command::ListTasks {
            status,
            workflow_id,
        } => serde_json::to_value(engine.list_tasks(status, workflow_id))?,
        Command::GetTask { id } => serde_json::to_value(engine.get_task(id)?)?,
        Command::Summary => serde_json::to_value(engine.summary())?,
        Command::CreateWorkflow { tasks, analyze } => {
            let specs = tasks.into_iter().map(WorkflowTaskSpec::from).collect();
            serde_json::to_value(engine.create_workflow(specs, analyze).await?)?
        }
        Command::WorkflowStatus { workflow_id } => {
            let wid = workflow_or_current(engine, workflow_id)?;
            serde_json::to_value(engine.workflow_status(wid)?)?
        }
        Command::AddSubtask { task_id, content } => {
            serde_json::to_value(engine.add_subtask(task_id, &content).await?)?
        }
        Command::UpdateSubtask {
            task_id,
            subtask_id,
            status,
            content,
        } => serde_json::to_value(
            engine
                .update_subtask(task_id, subtask_id, status, content)
                .await?,
        )?,
        Command::Analyze { id } => serde_json::to_value(engine.analyze_task(id).await?)?,
        Command::Checkpoint {
            id,
            note,
            environment,
        } => serde_json::to_value(engine.checkpoint(id, &note, environment).await?)?,
        Command::ToggleAutoProgression { enabled } => {
            let target = enabled.unwrap_or(!engine.auto_progression());
            let enabled = engine.set_auto_progression(target).await;
            json!({ "auto_progression_enabled": enabled })
        }
        Command::Approve { id, notes } => serde_json::to_value(engine.approve_task(id, notes).await?)?,
        Command::RequestGuidance { id } => serde_json::to_value(engine.request_guidance(id).await?)?,
        Command::GetGuidance { id } => serde_json::to_value(engine.guidance_for_task(id)?)?,
        Command::GetNextSteps { id } => {
            json!({ "task_id": id, "steps": engine.next_steps_for_task(id)? })
        }
        Command::Clear { archive } => serde_json::to_value(engine.clear(archive).await?)?,
        Command::ListArchived => serde_json::to_value(engine.archived_sessions().await)?,
        Command::AddContext {
            workflow_id,
            kind,
            content,
            task_id,
            priority,
        } => {
            let wid = workflow_or_current(engine, workflow_id)?;
            if content.trim().is_empty() {
                return Err(EngineError::InvalidInput("context content must not be empty".into()));
            }
            let mut snapshot = ContextSnapshot::new(kind, content);
            if let Some(task_id) = task_id {
                snapshot = snapshot.with_task(task_id);
            }
            if let Some(priority) = priority {
                snapshot = snapshot.with_priority(priority);
            }
            let tokens = engine.add_context(wid, snapshot);
            json!({
                "workflow_id": wid,
                "tokens": tokens,
                "total_tokens": engine.context().total_tokens(wid),
                "events": engine.context().event_count(wid),
            })
        }
        Command::GetContext {
            workflow_id,
            prompt,
        } => {
            let wid = workflow_or_current(engine, workflow_id)?;
            serde_json::to_value(engine.get_context_for_ai(wid, &prompt).await)?
        }
    };
    Ok(value)
}
