use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tp_bridge::{EngineEvent, EventBus};
use tp_context::{
    AccumulatorConfig, AiContext, CleanupReport, CompressorConfig, ContextAccumulator,
    ContextCompressor, ContextSnapshot, SnapshotKind, WorkflowContext,
};
use tp_core::config::Config;
use tp_core::state_store::StateStore;
use tp_core::types::{HistoryAction, Priority, Task, TaskState, TaskStatus};
use tp_intelligence::ModelGateway;

use crate::error::{EngineError, Result};
use crate::resolver;
use crate::store::{TaskStore, TaskUpdate};

/// Engine handle shared between the command surface and the monitor.
pub type SharedEngine = Arc<tokio::sync::Mutex<WorkflowEngine>>;

// ---------------------------------------------------------------------------
// Transition reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied { from: TaskStatus, to: TaskStatus },
    /// A start request was redirected because dependencies are unmet.
    Blocked { reason: String, unmet: Vec<Uuid> },
}

/// What auto-progression did after a completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Progression {
    Started { next_task: Uuid },
    WorkflowCompleted { workflow_id: Uuid },
    /// No pending successor yet, but non-terminal members remain.
    Waiting { remaining: usize },
    /// The designated successor could not be started.
    Stalled { next_task: Uuid, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionReport {
    pub task: Task,
    #[serde(flatten)]
    pub outcome: TransitionOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unblocked: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progression: Option<Progression>,
}

impl TransitionReport {
    pub fn is_blocked(&self) -> bool {
        matches!(self.outcome, TransitionOutcome::Blocked { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub session_id: Uuid,
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub completion_percent: f64,
    pub current_workflow_id: Option<Uuid>,
    pub auto_progression_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub removed_tasks: usize,
    pub archived_session: Option<Uuid>,
    pub new_session: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedSession {
    pub session_id: Uuid,
    pub task_count: usize,
    pub last_updated: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Owns the task store and the context log for one session.
///
/// All mutations run to completion on `&mut self`; the only suspension
/// points are persistence writes and model calls. Persistence failures are
/// logged and collected as warnings, never raised.
pub struct WorkflowEngine {
    pub(crate) store: TaskStore,
    pub(crate) context: ContextAccumulator,
    pub(crate) compressor: ContextCompressor,
    pub(crate) bus: EventBus,
    persistence: Arc<dyn StateStore>,
    session_id: Uuid,
    auto_progression: bool,
    pub(crate) current_workflow: Option<Uuid>,
    pub(crate) analyze_on_create: bool,
    warnings: Vec<String>,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(
        config: &Config,
        gateway: ModelGateway,
        persistence: Arc<dyn StateStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            store: TaskStore::new(config.engine.agent_id.clone()),
            context: ContextAccumulator::new(AccumulatorConfig::from(&config.context)),
            compressor: ContextCompressor::new(CompressorConfig::from(&config.context), gateway),
            bus,
            persistence,
            session_id: Uuid::new_v4(),
            auto_progression: config.engine.auto_progression,
            current_workflow: None,
            analyze_on_create: config.engine.analyze_on_create,
            warnings: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Build an engine and restore persisted state. A read failure starts
    /// empty with a warning.
    pub async fn load(
        config: &Config,
        gateway: ModelGateway,
        persistence: Arc<dyn StateStore>,
        bus: EventBus,
    ) -> Self {
        let mut engine = Self::new(config, gateway, persistence, bus);
        match engine.persistence.read_state().await {
            Ok(Some(state)) => engine.restore(state),
            Ok(None) => debug!("no saved state, starting empty"),
            Err(e) => {
                warn!(error = %e, "could not read saved state, starting empty");
                engine
                    .warnings
                    .push(format!("could not read saved state, starting empty: {e}"));
            }
        }
        engine
    }

    fn restore(&mut self, state: TaskState) {
        info!(
            session_id = %state.session_id,
            tasks = state.tasks.len(),
            "restored saved state"
        );
        self.session_id = state.session_id;
        self.auto_progression = state.auto_progression_enabled;
        self.store.replace_all(state.tasks);
        self.current_workflow = state
            .current_workflow_id
            .filter(|wid| !self.store.by_workflow(*wid).is_empty());
    }

    pub fn into_shared(self) -> SharedEngine {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    // -- Accessors ----------------------------------------------------------

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn auto_progression(&self) -> bool {
        self.auto_progression
    }

    pub fn current_workflow(&self) -> Option<Uuid> {
        self.current_workflow
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn context(&self) -> &ContextAccumulator {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextAccumulator {
        &mut self.context
    }

    pub fn gateway(&self) -> &ModelGateway {
        self.compressor.gateway()
    }

    /// Token cancelled on shutdown; model calls observe a child of it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain warnings collected since the last call.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub(crate) fn warn_user(&mut self, message: String) {
        self.warnings.push(message);
    }

    // -- Persistence --------------------------------------------------------

    pub fn state(&self) -> TaskState {
        TaskState {
            session_id: self.session_id,
            tasks: self.store.to_vec(),
            last_updated: Utc::now(),
            auto_progression_enabled: self.auto_progression,
            current_workflow_id: self.current_workflow,
        }
    }

    /// Write the full state. Failure keeps the in-memory state and records
    /// a warning.
    pub async fn persist(&mut self) {
        let state = self.state();
        if let Err(e) = self.persistence.write_state(&state).await {
            warn!(error = %e, "failed to persist task state");
            self.warnings.push(format!("state not saved: {e}"));
        }
    }

    // -- Tasks --------------------------------------------------------------

    pub async fn create_task(
        &mut self,
        content: &str,
        priority: Option<Priority>,
        tags: Vec<String>,
        dependencies: Vec<Uuid>,
    ) -> Result<Task> {
        let placeholder = Uuid::nil();
        resolver::validate_dependencies(&self.store, placeholder, &dependencies)?;
        let id = self.store.create(content, priority, tags)?;
        self.store.require_mut(id)?.dependencies = dependencies;
        info!(task_id = %id, "task created");

        if self.analyze_on_create {
            self.analyze_in_place(id).await?;
        }
        self.persist().await;
        Ok(self.store.require(id)?.clone())
    }

    pub fn get_task(&mut self, id: Uuid) -> Result<Task> {
        self.store
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::task_not_found(id))
    }

    /// Tasks ordered most recently updated first, optionally filtered.
    pub fn list_tasks(&self, status: Option<TaskStatus>, workflow_id: Option<Uuid>) -> Vec<Task> {
        self.store
            .list()
            .into_iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .filter(|t| workflow_id.is_none_or(|w| t.is_member_of(w)))
            .cloned()
            .collect()
    }

    pub async fn update_task(&mut self, id: Uuid, update: TaskUpdate) -> Result<Task> {
        if update.is_empty() {
            return Err(EngineError::InvalidInput("no fields to update".into()));
        }
        if let Some(ref deps) = update.dependencies {
            resolver::validate_dependencies(&self.store, id, deps)?;
        }
        let deps_changed = update.dependencies.is_some();
        self.store.update(id, update)?;
        if deps_changed {
            resolver::resolve_touched(&mut self.store, &[id]);
        }
        self.persist().await;
        Ok(self.store.require(id)?.clone())
    }

    /// Delete a task. Dependents inherit its dependencies so ordering is
    /// preserved, and workflow positions are renumbered.
    pub async fn delete_task(&mut self, id: Uuid) -> Result<Task> {
        let removed = self
            .store
            .delete(id)
            .ok_or_else(|| EngineError::task_not_found(id))?;
        let touched = resolver::strip_dependency(&mut self.store, id, &removed.dependencies);
        resolver::resolve_touched(&mut self.store, &touched);

        if let Some(wid) = removed.workflow_id() {
            self.renumber_workflow(wid);
            if self.current_workflow == Some(wid) && self.store.by_workflow(wid).is_empty() {
                info!(workflow_id = %wid, "last workflow member deleted, clearing current workflow");
                self.current_workflow = None;
            }
        }
        info!(task_id = %id, "task deleted");
        self.persist().await;
        Ok(removed)
    }

    fn renumber_workflow(&mut self, workflow_id: Uuid) {
        let ids: Vec<Uuid> = self
            .store
            .by_workflow(workflow_id)
            .iter()
            .map(|t| t.id)
            .collect();
        for (pos, id) in ids.into_iter().enumerate() {
            if let Some(link) = self.store.get_mut(id).and_then(|t| t.workflow.as_mut()) {
                link.position = pos as u32;
            }
        }
    }

    pub async fn add_subtask(&mut self, task_id: Uuid, content: &str) -> Result<Task> {
        self.store.add_subtask(task_id, content)?;
        self.persist().await;
        Ok(self.store.require(task_id)?.clone())
    }

    pub async fn update_subtask(
        &mut self,
        task_id: Uuid,
        subtask_id: Uuid,
        status: Option<tp_core::types::SubTaskStatus>,
        content: Option<String>,
    ) -> Result<Task> {
        if status.is_none() && content.is_none() {
            return Err(EngineError::InvalidInput("no subtask fields to update".into()));
        }
        self.store.update_subtask(task_id, subtask_id, status, content)?;
        self.persist().await;
        Ok(self.store.require(task_id)?.clone())
    }

    // -- Status transitions -------------------------------------------------

    pub async fn set_status(
        &mut self,
        id: Uuid,
        to: TaskStatus,
        notes: Option<String>,
    ) -> Result<TransitionReport> {
        let report = self.transition(id, to, notes)?;
        self.persist().await;
        Ok(report)
    }

    pub async fn start_task(&mut self, id: Uuid) -> Result<TransitionReport> {
        self.set_status(id, TaskStatus::InProgress, None).await
    }

    pub async fn complete_task(&mut self, id: Uuid, notes: Option<String>) -> Result<TransitionReport> {
        self.set_status(id, TaskStatus::Completed, notes).await
    }

    pub async fn cancel_task(&mut self, id: Uuid, notes: Option<String>) -> Result<TransitionReport> {
        self.set_status(id, TaskStatus::Cancelled, notes).await
    }

    pub async fn pause_task(&mut self, id: Uuid) -> Result<TransitionReport> {
        self.set_status(id, TaskStatus::Paused, None).await
    }

    /// Return a paused task to the status it was paused from.
    pub async fn resume_task(&mut self, id: Uuid) -> Result<TransitionReport> {
        let task = self.store.require(id)?;
        let target = match (task.status, task.paused_from) {
            (TaskStatus::Paused, Some(prior)) => prior,
            (TaskStatus::Paused, None) => TaskStatus::Pending,
            (status, _) => {
                return Err(EngineError::InvalidInput(format!(
                    "task {id} is not paused (status {status})"
                )))
            }
        };
        self.set_status(id, target, None).await
    }

    /// Move an `awaiting_approval` task to `pending`, starting it at once
    /// when auto-progression would.
    pub async fn approve_task(&mut self, id: Uuid, notes: Option<String>) -> Result<TransitionReport> {
        let task = self.store.require(id)?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(EngineError::InvalidTransition {
                task_id: id,
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        let workflow_id = task.workflow_id();
        self.apply(id, TaskStatus::Pending, HistoryAction::Approved, notes)?;
        info!(task_id = %id, "task approved");

        let mut to = TaskStatus::Pending;
        if self.auto_progression
            && workflow_id.is_some()
            && workflow_id == self.current_workflow
            && resolver::unmet_dependencies(&self.store, id).is_empty()
            && !self.workflow_has_active(workflow_id)
        {
            self.apply(
                id,
                TaskStatus::InProgress,
                HistoryAction::AutoProgressed,
                Some("started after approval".into()),
            )?;
            to = TaskStatus::InProgress;
        }

        let report = TransitionReport {
            task: self.store.require(id)?.clone(),
            outcome: TransitionOutcome::Applied {
                from: TaskStatus::AwaitingApproval,
                to,
            },
            unblocked: Vec::new(),
            progression: None,
        };
        self.persist().await;
        Ok(report)
    }

    fn workflow_has_active(&self, workflow_id: Option<Uuid>) -> bool {
        workflow_id.is_some_and(|wid| {
            self.store
                .by_workflow(wid)
                .iter()
                .any(|t| t.status == TaskStatus::InProgress)
        })
    }

    /// The synchronous transition core. Dependency resolution for a
    /// completion always finishes before the progression decision.
    pub(crate) fn transition(
        &mut self,
        id: Uuid,
        to: TaskStatus,
        notes: Option<String>,
    ) -> Result<TransitionReport> {
        let task = self.store.require(id)?;
        let from = task.status;
        let paused_from = task.paused_from;

        let resuming_work = from == TaskStatus::Paused && paused_from == Some(TaskStatus::InProgress);
        if to == TaskStatus::InProgress
            && (matches!(from, TaskStatus::Pending | TaskStatus::Blocked) || resuming_work)
        {
            let unmet = resolver::unmet_dependencies(&self.store, id);
            if !unmet.is_empty() {
                return self.block_on(id, from, unmet);
            }
        }

        check_transition(id, from, paused_from, to)?;

        let action = match (from, to) {
            (_, TaskStatus::Cancelled) => HistoryAction::Cancelled,
            (TaskStatus::Paused, _) => HistoryAction::Resumed,
            (_, TaskStatus::Paused) => HistoryAction::Paused,
            (_, TaskStatus::Blocked) => HistoryAction::Blocked,
            _ => HistoryAction::StatusChanged,
        };
        self.apply(id, to, action, notes.clone())?;
        info!(task_id = %id, from = %from, to = %to, "task status changed");

        let mut report = TransitionReport {
            task: self.store.require(id)?.clone(),
            outcome: TransitionOutcome::Applied { from, to },
            unblocked: Vec::new(),
            progression: None,
        };

        if to == TaskStatus::Completed {
            report.unblocked = resolver::resolve_completion(&mut self.store, id);
            self.record_result(id, notes.as_deref());
            report.progression = self.progress_after(id);
        }
        Ok(report)
    }

    fn block_on(&mut self, id: Uuid, from: TaskStatus, unmet: Vec<Uuid>) -> Result<TransitionReport> {
        let reason = resolver::blocked_reason(&unmet);
        if from == TaskStatus::Blocked {
            let entry = self
                .store
                .entry(HistoryAction::Blocked)
                .with_notes(reason.clone());
            let task = self.store.require_mut(id)?;
            task.blocked_reason = Some(reason.clone());
            task.record(entry);
        } else {
            self.apply(id, TaskStatus::Blocked, HistoryAction::Blocked, Some(reason.clone()))?;
        }
        info!(task_id = %id, unmet = unmet.len(), "start redirected to blocked");
        Ok(TransitionReport {
            task: self.store.require(id)?.clone(),
            outcome: TransitionOutcome::Blocked { reason, unmet },
            unblocked: Vec::new(),
            progression: None,
        })
    }

    /// Write a status change onto the task, maintaining the timing and
    /// blocked/paused bookkeeping fields.
    pub(crate) fn apply(
        &mut self,
        id: Uuid,
        to: TaskStatus,
        action: HistoryAction,
        notes: Option<String>,
    ) -> Result<TaskStatus> {
        let mut entry = self.store.entry(action);
        let now = entry.timestamp;
        let task = self.store.require_mut(id)?;
        let from = task.status;
        entry = entry.with_transition(from, to);

        match to {
            TaskStatus::InProgress => {
                task.started_at.get_or_insert(now);
            }
            TaskStatus::Completed => {
                task.completed_at = Some(now);
                if let Some(started) = task.started_at {
                    let ms = (now - started).num_milliseconds().max(0) as u64;
                    entry = entry.with_duration_ms(ms);
                    if task.actual_minutes.is_none() {
                        task.actual_minutes = Some(ms as f64 / 60_000.0);
                    }
                }
            }
            TaskStatus::Paused => task.paused_from = Some(from),
            TaskStatus::Blocked => {
                task.blocked_since.get_or_insert(now);
                match notes {
                    Some(ref reason) => task.blocked_reason = Some(reason.clone()),
                    None if task.blocked_reason.is_none() => {
                        task.blocked_reason = Some("blocked manually".into())
                    }
                    None => {}
                }
            }
            _ => {}
        }
        if from == TaskStatus::Paused {
            task.paused_from = None;
        }
        if !matches!(to, TaskStatus::Blocked | TaskStatus::Paused) {
            task.blocked_reason = None;
            task.blocked_since = None;
        }
        if let Some(notes) = notes {
            entry = entry.with_notes(notes);
        }
        task.status = to;
        task.record(entry);
        Ok(from)
    }

    fn record_result(&mut self, id: Uuid, notes: Option<&str>) {
        let Some(task) = self.store.peek(id) else {
            return;
        };
        let Some(wid) = task.workflow_id() else {
            return;
        };
        let mut content = format!("Completed: {}", task.content);
        if let Some(notes) = notes {
            content.push_str("\nNotes: ");
            content.push_str(notes);
        }
        let mut snapshot = ContextSnapshot::new(SnapshotKind::TaskResult, content).with_task(id);
        if let Some(priority) = task.priority {
            snapshot = snapshot.with_priority(priority);
        }
        self.context.add_context(wid, snapshot);
    }

    /// Auto-progression after `completed_id` reached `completed`.
    ///
    /// Only completions in the current workflow progress, and only pending
    /// members positioned after the completed task are candidates.
    fn progress_after(&mut self, completed_id: Uuid) -> Option<Progression> {
        if !self.auto_progression {
            return None;
        }
        let completed = self.store.peek(completed_id)?;
        let wid = completed.workflow_id()?;
        if self.current_workflow != Some(wid) {
            return None;
        }
        let after = completed.position().unwrap_or(0);

        let members = self.store.by_workflow(wid);
        let next = members
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.position().unwrap_or(0) > after)
            .min_by_key(|t| (t.created_at, t.position()))
            .map(|t| t.id);
        let remaining = members.iter().filter(|t| !t.status.is_terminal()).count();

        let Some(next_id) = next else {
            if remaining == 0 {
                info!(workflow_id = %wid, "workflow completed");
                self.current_workflow = None;
                self.bus.publish(EngineEvent::WorkflowCompleted {
                    workflow_id: wid,
                    completed_task: completed_id,
                });
                return Some(Progression::WorkflowCompleted { workflow_id: wid });
            }
            info!(workflow_id = %wid, remaining, "workflow waiting on non-pending members");
            return Some(Progression::Waiting { remaining });
        };

        let unmet = resolver::unmet_dependencies(&self.store, next_id);
        if !unmet.is_empty() {
            let reason = resolver::blocked_reason(&unmet);
            warn!(workflow_id = %wid, task_id = %next_id, %reason, "auto-progression stalled");
            return Some(Progression::Stalled {
                next_task: next_id,
                reason,
            });
        }

        if let Err(e) = self.apply(
            next_id,
            TaskStatus::InProgress,
            HistoryAction::AutoProgressed,
            Some(format!("auto-progressed after {completed_id}")),
        ) {
            warn!(workflow_id = %wid, task_id = %next_id, error = %e, "auto-progression stalled");
            return Some(Progression::Stalled {
                next_task: next_id,
                reason: e.to_string(),
            });
        }

        info!(workflow_id = %wid, completed = %completed_id, next = %next_id, "auto-progressed");
        self.bus.publish(EngineEvent::TaskAutoProgressed {
            completed_task: completed_id,
            next_task: next_id,
            workflow_id: wid,
        });
        let content = self
            .store
            .peek(next_id)
            .map(|t| format!("Started: {}", t.content))
            .unwrap_or_default();
        self.context.add_context(
            wid,
            ContextSnapshot::new(SnapshotKind::ProgressNote, content).with_task(next_id),
        );
        Some(Progression::Started { next_task: next_id })
    }

    // -- Session ------------------------------------------------------------

    pub fn summary(&self) -> EngineSummary {
        let mut by_status = BTreeMap::new();
        for status in TaskStatus::all() {
            by_status.insert(status.to_string(), self.store.count_by_status(*status));
        }
        let total = self.store.len();
        let completed = self.store.count_by_status(TaskStatus::Completed);
        let completion_percent = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64 * 1000.0).round() / 10.0
        };
        EngineSummary {
            session_id: self.session_id,
            total,
            by_status,
            completion_percent,
            current_workflow_id: self.current_workflow,
            auto_progression_enabled: self.auto_progression,
        }
    }

    pub async fn set_auto_progression(&mut self, enabled: bool) -> bool {
        if self.auto_progression != enabled {
            info!(enabled, "auto-progression toggled");
        }
        self.auto_progression = enabled;
        self.persist().await;
        enabled
    }

    /// Reset the session. With `archive`, the current state is first kept
    /// in the session archive under its session id.
    pub async fn clear(&mut self, archive: bool) -> Result<ClearReport> {
        let removed_tasks = self.store.len();
        let mut archived_session = None;
        if archive {
            let mut sessions = match self.persistence.read_archive().await {
                Ok(found) => found.unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, "could not read session archive, starting a new one");
                    self.warnings
                        .push(format!("session archive unreadable, replaced: {e}"));
                    Default::default()
                }
            };
            sessions.insert(self.state());
            match self.persistence.write_archive(&sessions).await {
                Ok(()) => archived_session = Some(self.session_id),
                Err(e) => {
                    warn!(error = %e, "failed to write session archive");
                    self.warnings.push(format!("session not archived: {e}"));
                }
            }
        }

        self.store.clear();
        self.context.clear();
        self.current_workflow = None;
        self.session_id = Uuid::new_v4();
        info!(removed_tasks, archived = archived_session.is_some(), "session cleared");
        self.persist().await;

        Ok(ClearReport {
            removed_tasks,
            archived_session,
            new_session: self.session_id,
        })
    }

    pub async fn archived_sessions(&mut self) -> Vec<ArchivedSession> {
        match self.persistence.read_archive().await {
            Ok(Some(archive)) => archive
                .sessions
                .values()
                .map(|s| ArchivedSession {
                    session_id: s.session_id,
                    task_count: s.tasks.len(),
                    last_updated: s.last_updated,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "could not read session archive");
                self.warnings.push(format!("session archive unreadable: {e}"));
                Vec::new()
            }
        }
    }

    // -- Context ------------------------------------------------------------

    pub fn add_context(&mut self, workflow_id: Uuid, snapshot: ContextSnapshot) -> usize {
        self.context.add_context(workflow_id, snapshot)
    }

    pub async fn get_context_for_ai(&mut self, workflow_id: Uuid, prompt: &str) -> AiContext {
        let cancel = self.cancel.child_token();
        self.compressor
            .build_context(&mut self.context, workflow_id, prompt, &cancel)
            .await
    }

    pub fn cleanup_context(&mut self) -> CleanupReport {
        let report = self.context.cleanup_old_context();
        if report.removed_snapshots + report.expired_summaries + report.removed_workflows > 0 {
            info!(
                removed_snapshots = report.removed_snapshots,
                expired_summaries = report.expired_summaries,
                removed_workflows = report.removed_workflows,
                "context cleanup"
            );
        }
        report
    }

    /// Replace the accumulated context with the log saved at `path`.
    ///
    /// A missing file leaves the context untouched; an unreadable one is a
    /// warning. Returns the number of workflows loaded.
    pub async fn load_context_file(&mut self, path: &Path) -> usize {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                self.context_file_warning(path, &e.to_string());
                return 0;
            }
        };
        match serde_json::from_str::<HashMap<Uuid, WorkflowContext>>(&data) {
            Ok(workflows) => {
                let count = workflows.len();
                self.context.import(workflows);
                debug!(path = %path.display(), workflows = count, "context loaded");
                count
            }
            Err(e) => {
                self.context_file_warning(path, &e.to_string());
                0
            }
        }
    }

    /// Write the accumulated context to `path`. Failure is a warning.
    pub async fn save_context_file(&mut self, path: &Path) {
        let result = async {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let json = serde_json::to_string(&self.context.export())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            tokio::fs::write(path, json).await
        }
        .await;
        if let Err(e) = result {
            self.context_file_warning(path, &e.to_string());
        }
    }

    fn context_file_warning(&mut self, path: &Path, error: &str) {
        warn!(path = %path.display(), error, "context file unusable");
        self.warnings
            .push(format!("context not persisted ({}): {error}", path.display()));
    }

    /// Cancel in-flight model calls.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

fn check_transition(
    id: Uuid,
    from: TaskStatus,
    paused_from: Option<TaskStatus>,
    to: TaskStatus,
) -> Result<()> {
    let allowed = match from {
        TaskStatus::Paused => to == TaskStatus::Cancelled || paused_from.unwrap_or(TaskStatus::Pending) == to,
        // approval goes through approve_task
        TaskStatus::AwaitingApproval if to == TaskStatus::Pending => false,
        _ => from.can_transition_to(&to),
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            task_id: id,
            from,
            to,
        })
    }
}
