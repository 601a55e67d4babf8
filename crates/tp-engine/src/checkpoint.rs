//! Checkpoints and recovery guidance.
//!
//! Checkpoints are advisory: they record where an agent was, never change
//! status, and are never rolled back to. Guidance reads are side-effect
//! free; only [`WorkflowEngine::request_guidance`] records what it produced.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use tp_context::{ContextPath, ContextSnapshot, SnapshotKind};
use tp_core::types::{
    AgentGuidance, AnalysisSource, Checkpoint, HistoryAction, SubTaskStatus, Task, TaskStatus,
};

use crate::engine::WorkflowEngine;
use crate::error::{EngineError, Result};
use crate::resolver;

const GUIDANCE_SYSTEM_PROMPT: &str = "You guide an AI coding agent through one step of a \
larger workflow. Give concrete, ordered instructions for the current task, say what output \
is expected and how to verify it. Be brief.";

/// Upcoming subtasks listed in next steps.
const MAX_SUBTASK_STEPS: usize = 5;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TaskBrief {
    pub id: Uuid,
    pub content: String,
    pub status: TaskStatus,
    pub position: Option<u32>,
}

impl From<&Task> for TaskBrief {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            content: task.content.clone(),
            status: task.status,
            position: task.position(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowPlacement {
    pub workflow_id: Uuid,
    pub position: u32,
    pub total: usize,
    pub previous: Vec<TaskBrief>,
    pub upcoming: Vec<TaskBrief>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtaskProgress {
    pub completed: usize,
    pub total: usize,
    pub ratio: f64,
}

/// Everything an agent needs to resume a task.
#[derive(Debug, Clone, Serialize)]
pub struct GuidanceReport {
    pub task: TaskBrief,
    pub checkpoint: Option<Checkpoint>,
    pub guidance: AgentGuidance,
    pub blocked_reason: Option<String>,
    pub workflow: Option<WorkflowPlacement>,
    pub unmet_dependencies: Vec<TaskBrief>,
    pub subtasks: SubtaskProgress,
    pub pending_subtasks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedGuidance {
    pub task_id: Uuid,
    pub text: String,
    pub source: AnalysisSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_path: Option<ContextPath>,
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl WorkflowEngine {
    /// Capture a checkpoint on the task. Status is left untouched.
    pub async fn checkpoint(
        &mut self,
        id: Uuid,
        note: &str,
        environment: BTreeMap<String, String>,
    ) -> Result<Checkpoint> {
        let note = note.trim();
        if note.is_empty() {
            return Err(EngineError::InvalidInput("checkpoint note must not be empty".into()));
        }
        let entry = self.store.entry(HistoryAction::Checkpoint);
        let task = self.store.require_mut(id)?;
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            context: note.to_string(),
            subtask_completion: task.subtask_completion(),
            environment,
        };
        task.context_snapshot = Some(checkpoint.clone());
        task.record(entry.with_notes(format!("checkpoint {}", checkpoint.id)));
        let workflow_id = task.workflow_id();
        let priority = task.priority;

        if let Some(wid) = workflow_id {
            let mut snapshot =
                ContextSnapshot::new(SnapshotKind::Checkpoint, note.to_string()).with_task(id);
            if let Some(priority) = priority {
                snapshot = snapshot.with_priority(priority);
            }
            self.context.add_context(wid, snapshot);
        }
        info!(task_id = %id, checkpoint_id = %checkpoint.id, "checkpoint recorded");
        self.persist().await;
        Ok(checkpoint)
    }

    /// Read-only recovery report for a task.
    pub fn guidance_for_task(&self, id: Uuid) -> Result<GuidanceReport> {
        let task = self.store.require(id)?;

        let workflow = task.workflow_id().map(|wid| {
            let members = self.store.by_workflow(wid);
            let position = task.position().unwrap_or(0);
            WorkflowPlacement {
                workflow_id: wid,
                position,
                total: members.len(),
                previous: members
                    .iter()
                    .filter(|t| t.position().unwrap_or(0) < position)
                    .map(|t| TaskBrief::from(*t))
                    .collect(),
                upcoming: members
                    .iter()
                    .filter(|t| t.position().unwrap_or(0) > position)
                    .map(|t| TaskBrief::from(*t))
                    .collect(),
            }
        });

        let unmet_dependencies = resolver::unmet_dependencies(&self.store, id)
            .into_iter()
            .map(|dep| match self.store.peek(dep) {
                Some(t) => TaskBrief::from(t),
                None => TaskBrief {
                    id: dep,
                    content: "(deleted task)".to_string(),
                    status: TaskStatus::Cancelled,
                    position: None,
                },
            })
            .collect();

        let completed = task
            .subtasks
            .iter()
            .filter(|s| s.status == SubTaskStatus::Completed)
            .count();

        Ok(GuidanceReport {
            task: TaskBrief::from(task),
            checkpoint: task.context_snapshot.clone(),
            guidance: task.guidance.clone(),
            blocked_reason: task.blocked_reason.clone(),
            workflow,
            unmet_dependencies,
            subtasks: SubtaskProgress {
                completed,
                total: task.subtasks.len(),
                ratio: task.subtask_completion(),
            },
            pending_subtasks: task
                .subtasks
                .iter()
                .filter(|s| s.status != SubTaskStatus::Completed)
                .map(|s| s.content.clone())
                .collect(),
        })
    }

    /// Ordered, human-readable next steps for a task.
    pub fn next_steps_for_task(&self, id: Uuid) -> Result<Vec<String>> {
        let report = self.guidance_for_task(id)?;
        let task = self.store.require(id)?;
        Ok(next_steps(&report, task.paused_from))
    }

    /// Ask the model for guidance using the workflow's compressed context,
    /// falling back to a template built from the recovery report.
    pub async fn request_guidance(&mut self, id: Uuid) -> Result<GeneratedGuidance> {
        let report = self.guidance_for_task(id)?;
        let paused_from = self.store.require(id)?.paused_from;
        let steps = next_steps(&report, paused_from);
        let prompt = guidance_prompt(&report);
        let workflow_id = report.workflow.as_ref().map(|w| w.workflow_id);

        let mut generated = None;
        if self.gateway().is_available() {
            let (context_text, path) = match workflow_id {
                Some(wid) => {
                    let ctx = self.get_context_for_ai(wid, &prompt).await;
                    (ctx.text, Some(ctx.path))
                }
                None => (prompt.clone(), None),
            };
            let cancel = self.cancel_token().child_token();
            let reply = self
                .gateway()
                .send_with_system(GUIDANCE_SYSTEM_PROMPT, &context_text, &cancel)
                .await;
            match reply {
                Ok(text) if !text.trim().is_empty() => {
                    generated = Some(GeneratedGuidance {
                        task_id: id,
                        text: text.trim().to_string(),
                        source: AnalysisSource::Ai,
                        context_path: path,
                    });
                }
                Ok(_) => debug!(task_id = %id, "empty guidance reply, using template"),
                Err(e) => {
                    debug!(task_id = %id, error = %e, "guidance request failed, using template");
                    self.warn_user(format!("model guidance unavailable: {e}"));
                }
            }
        }

        let generated = generated.unwrap_or_else(|| GeneratedGuidance {
            task_id: id,
            text: render_template(&report, &steps),
            source: AnalysisSource::Heuristic,
            context_path: None,
        });

        if let Some(wid) = workflow_id {
            self.context.add_context(
                wid,
                ContextSnapshot::new(SnapshotKind::AgentGuidance, generated.text.clone())
                    .with_task(id),
            );
        }
        info!(task_id = %id, source = ?generated.source, "guidance produced");
        Ok(generated)
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn next_steps(report: &GuidanceReport, paused_from: Option<TaskStatus>) -> Vec<String> {
    let mut steps = Vec::new();
    let task = &report.task;

    match task.status {
        TaskStatus::Completed => steps.push("Task is complete.".to_string()),
        TaskStatus::Cancelled => {
            steps.push("Task was cancelled; no further steps.".to_string());
            return steps;
        }
        TaskStatus::AwaitingApproval => {
            steps.push(format!("Request approval for: {}", task.content));
            steps.push("Approve the task once the plan is accepted".to_string());
        }
        TaskStatus::Paused => {
            let prior = paused_from.unwrap_or(TaskStatus::Pending);
            steps.push(format!("Resume the task (it was {prior} before pausing)"));
        }
        TaskStatus::Blocked | TaskStatus::Pending if !report.unmet_dependencies.is_empty() => {
            if let Some(reason) = &report.blocked_reason {
                steps.push(format!("Resolve the blocker: {reason}"));
            }
            for dep in &report.unmet_dependencies {
                steps.push(format!("Complete dependency: {}", dep.content));
            }
        }
        TaskStatus::Blocked => {
            steps.push("Dependencies are met; move the task back to pending".to_string());
        }
        TaskStatus::Pending => steps.push(format!("Start the task: {}", task.content)),
        TaskStatus::InProgress => {
            if let Some(cp) = &report.checkpoint {
                steps.push(format!("Continue from checkpoint: {}", cp.context));
            }
            if let Some(instructions) = &report.guidance.instructions {
                steps.push(format!("Follow instructions: {instructions}"));
            }
            for sub in report.pending_subtasks.iter().take(MAX_SUBTASK_STEPS) {
                steps.push(format!("Finish subtask: {sub}"));
            }
            if let Some(expected) = &report.guidance.expected_output {
                steps.push(format!("Produce: {expected}"));
            }
            for criterion in &report.guidance.validation_criteria {
                steps.push(format!("Verify: {criterion}"));
            }
            steps.push("Mark the task completed when done".to_string());
        }
    }

    if let Some(next) = report
        .workflow
        .as_ref()
        .and_then(|w| w.upcoming.iter().find(|t| !t.status.is_terminal()))
    {
        steps.push(format!("Then: {}", next.content));
    }
    steps
}

fn guidance_prompt(report: &GuidanceReport) -> String {
    let mut prompt = format!(
        "Current task: {}\nStatus: {}\n",
        report.task.content, report.task.status
    );
    if let Some(objective) = &report.guidance.parent_objective {
        prompt.push_str(&format!("Overall objective: {objective}\n"));
    }
    if let Some(cp) = &report.checkpoint {
        prompt.push_str(&format!(
            "Last checkpoint ({}): {}\n",
            cp.timestamp.to_rfc3339(),
            cp.context
        ));
    }
    if report.subtasks.total > 0 {
        prompt.push_str(&format!(
            "Subtasks: {} of {} done\n",
            report.subtasks.completed, report.subtasks.total
        ));
    }
    if let Some(w) = &report.workflow {
        prompt.push_str(&format!("Workflow step {} of {}\n", w.position + 1, w.total));
    }
    prompt.push_str("What should the agent do next?");
    prompt
}

fn render_template(report: &GuidanceReport, steps: &[String]) -> String {
    let mut out = format!("## Guidance: {}\n\nStatus: {}\n", report.task.content, report.task.status);
    if let Some(objective) = &report.guidance.parent_objective {
        out.push_str(&format!("Objective: {objective}\n"));
    }
    if let Some(w) = &report.workflow {
        out.push_str(&format!("Workflow step: {} of {}\n", w.position + 1, w.total));
    }
    if let Some(cp) = &report.checkpoint {
        out.push_str(&format!(
            "Last checkpoint: {} ({:.0}% of subtasks done)\n",
            cp.context,
            cp.subtask_completion * 100.0
        ));
    }
    out.push_str("\n### Next steps\n");
    for (i, step) in steps.iter().enumerate() {
        out.push_str(&format!("{}. {step}\n", i + 1));
    }
    if let Some(recovery) = &report.guidance.recovery_instructions {
        out.push_str(&format!("\n### If something goes wrong\n{recovery}\n"));
    }
    out
}
