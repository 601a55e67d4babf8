use ahash::AHashMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use tp_core::types::{
    AgentGuidance, HistoryAction, HistoryEntry, Priority, SubTask, SubTaskStatus, Task, TaskStatus,
};

use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// TaskUpdate
// ---------------------------------------------------------------------------

/// Field changes accepted by [`TaskStore::update`]. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub dependencies: Option<Vec<Uuid>>,
    #[serde(default)]
    pub guidance: Option<AgentGuidance>,
    #[serde(default)]
    pub estimated_minutes: Option<f64>,
    #[serde(default)]
    pub actual_minutes: Option<f64>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.priority.is_none()
            && self.tags.is_none()
            && self.dependencies.is_none()
            && self.guidance.is_none()
            && self.estimated_minutes.is_none()
            && self.actual_minutes.is_none()
    }

    fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.content.is_some() {
            fields.push("content");
        }
        if self.priority.is_some() {
            fields.push("priority");
        }
        if self.tags.is_some() {
            fields.push("tags");
        }
        if self.dependencies.is_some() {
            fields.push("dependencies");
        }
        if self.guidance.is_some() {
            fields.push("guidance");
        }
        if self.estimated_minutes.is_some() {
            fields.push("estimated_minutes");
        }
        if self.actual_minutes.is_some() {
            fields.push("actual_minutes");
        }
        fields
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Owns every task for the lifetime of an engine session.
///
/// Mutations bump `updated_at` and append a history entry attributed to
/// `agent_id`. Dependency validation lives in [`crate::resolver`].
#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks: AHashMap<Uuid, Task>,
    agent_id: String,
}

impl TaskStore {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            tasks: AHashMap::new(),
            agent_id: agent_id.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn entry(&self, action: HistoryAction) -> HistoryEntry {
        HistoryEntry::new(action, self.agent_id.clone())
    }

    /// Create a standalone task. Fails on empty content.
    pub fn create(
        &mut self,
        content: &str,
        priority: Option<Priority>,
        tags: Vec<String>,
    ) -> Result<Uuid> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::InvalidInput("task content must not be empty".into()));
        }
        let mut task = Task::new(content);
        task.priority = priority;
        task.tags = tags;
        Ok(self.insert(task))
    }

    /// Insert a fully built task, recording its creation.
    pub fn insert(&mut self, mut task: Task) -> Uuid {
        let entry = self
            .entry(HistoryAction::Created)
            .with_notes(format!("created with status {}", task.status));
        task.record(entry);
        let id = task.id;
        debug!(task_id = %id, status = %task.status, "task created");
        self.tasks.insert(id, task);
        id
    }

    /// Fetch a task and refresh its last-access time.
    pub fn get(&mut self, id: Uuid) -> Option<&Task> {
        let task = self.tasks.get_mut(&id)?;
        task.last_accessed_at = Utc::now();
        Some(task)
    }

    /// Fetch without touching access time.
    pub fn peek(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn require(&self, id: Uuid) -> Result<&Task> {
        self.tasks.get(&id).ok_or_else(|| EngineError::task_not_found(id))
    }

    pub fn require_mut(&mut self, id: Uuid) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::task_not_found(id))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.tasks.contains_key(&id)
    }

    /// All tasks, most recently updated first.
    pub fn list(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Members of a workflow in position order.
    pub fn by_workflow(&self, workflow_id: Uuid) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.is_member_of(workflow_id))
            .collect();
        tasks.sort_by_key(|t| (t.position().unwrap_or(u32::MAX), t.created_at));
        tasks
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.tasks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn delete(&mut self, id: Uuid) -> Option<Task> {
        let removed = self.tasks.remove(&id);
        if removed.is_some() {
            debug!(task_id = %id, "task deleted");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Replace the whole collection (used when loading persisted state).
    pub fn replace_all(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks.into_iter().map(|t| (t.id, t)).collect();
    }

    /// Owned copy in creation order, for persistence.
    pub fn to_vec(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Apply field changes. Dependency lists must already be validated.
    pub fn update(&mut self, id: Uuid, update: TaskUpdate) -> Result<&Task> {
        if let Some(ref content) = update.content {
            if content.trim().is_empty() {
                return Err(EngineError::InvalidInput("task content must not be empty".into()));
            }
        }
        let notes = format!("updated {}", update.changed_fields().join(", "));
        let entry = self.entry(HistoryAction::Updated).with_notes(notes);
        let task = self.require_mut(id)?;

        if let Some(content) = update.content {
            task.content = content.trim().to_string();
        }
        if let Some(priority) = update.priority {
            task.priority = Some(priority);
        }
        if let Some(tags) = update.tags {
            task.tags = tags;
        }
        if let Some(deps) = update.dependencies {
            task.dependencies = deps;
        }
        if let Some(guidance) = update.guidance {
            task.guidance = guidance;
        }
        if let Some(minutes) = update.estimated_minutes {
            task.estimated_minutes = Some(minutes);
        }
        if let Some(minutes) = update.actual_minutes {
            task.actual_minutes = Some(minutes);
        }
        task.record(entry);
        Ok(task)
    }

    // -- Subtasks -----------------------------------------------------------

    pub fn add_subtask(&mut self, task_id: Uuid, content: &str) -> Result<Uuid> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::InvalidInput("subtask content must not be empty".into()));
        }
        let entry = self
            .entry(HistoryAction::SubtaskAdded)
            .with_notes(content.to_string());
        let task = self.require_mut(task_id)?;
        let subtask = SubTask::new(content);
        let id = subtask.id;
        task.subtasks.push(subtask);
        task.record(entry);
        Ok(id)
    }

    pub fn update_subtask(
        &mut self,
        task_id: Uuid,
        subtask_id: Uuid,
        status: Option<SubTaskStatus>,
        content: Option<String>,
    ) -> Result<&SubTask> {
        if let Some(ref c) = content {
            if c.trim().is_empty() {
                return Err(EngineError::InvalidInput("subtask content must not be empty".into()));
            }
        }
        let entry = self.entry(HistoryAction::SubtaskUpdated);
        let task = self.require_mut(task_id)?;
        let now = Utc::now();
        let subtask = task
            .subtask_mut(subtask_id)
            .ok_or_else(|| EngineError::subtask_not_found(subtask_id))?;
        let mut notes = Vec::new();
        if let Some(status) = status {
            subtask.status = status;
            notes.push(format!("status {:?}", status).to_lowercase());
        }
        if let Some(content) = content {
            subtask.content = content.trim().to_string();
            notes.push("content".to_string());
        }
        subtask.updated_at = now;
        let label = subtask.content.clone();
        task.record(entry.with_notes(format!("{label}: {}", notes.join(", "))));
        task.subtask_mut(subtask_id)
            .map(|s| &*s)
            .ok_or_else(|| EngineError::subtask_not_found(subtask_id))
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new("test-agent")
    }

    #[test]
    fn create_rejects_empty_content() {
        let mut s = store();
        let err = s.create("   ", None, vec![]).expect_err("empty content");
        assert_eq!(err.kind(), "invalid_input");
        assert!(s.is_empty());
    }

    #[test]
    fn create_records_history() {
        let mut s = store();
        let id = s
            .create("  write docs ", Some(Priority::High), vec!["docs".into()])
            .expect("create");
        let task = s.peek(id).expect("task");
        assert_eq!(task.content, "write docs");
        assert_eq!(task.history.len(), 1);
        assert_eq!(task.history[0].action, HistoryAction::Created);
        assert_eq!(task.history[0].agent, "test-agent");
    }

    #[test]
    fn list_is_most_recently_updated_first() {
        let mut s = store();
        let a = s.create("a", None, vec![]).expect("a");
        let b = s.create("b", None, vec![]).expect("b");
        std::thread::sleep(std::time::Duration::from_millis(2));
        s.update(
            a,
            TaskUpdate {
                content: Some("a2".into()),
                ..Default::default()
            },
        )
        .expect("update");
        let ids: Vec<Uuid> = s.list().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn get_touches_last_accessed_only() {
        let mut s = store();
        let id = s.create("a", None, vec![]).expect("a");
        let before = s.peek(id).expect("task").clone();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let after = s.get(id).expect("task");
        assert!(after.last_accessed_at > before.last_accessed_at);
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.history.len(), before.history.len());
    }

    #[test]
    fn update_appends_history_and_bumps_updated_at() {
        let mut s = store();
        let id = s.create("a", None, vec![]).expect("a");
        let before = s.peek(id).expect("task").updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let task = s
            .update(
                id,
                TaskUpdate {
                    priority: Some(Priority::Low),
                    estimated_minutes: Some(30.0),
                    ..Default::default()
                },
            )
            .expect("update");
        assert!(task.updated_at > before);
        let last = task.history.last().expect("history");
        assert_eq!(last.action, HistoryAction::Updated);
        assert_eq!(last.notes.as_deref(), Some("updated priority, estimated_minutes"));
    }

    #[test]
    fn subtask_lifecycle() {
        let mut s = store();
        let id = s.create("parent", None, vec![]).expect("parent");
        let sid = s.add_subtask(id, "child").expect("subtask");
        let sub = s
            .update_subtask(id, sid, Some(SubTaskStatus::Completed), None)
            .expect("update subtask");
        assert_eq!(sub.status, SubTaskStatus::Completed);

        let err = s
            .update_subtask(id, Uuid::new_v4(), Some(SubTaskStatus::Completed), None)
            .expect_err("missing subtask");
        assert_eq!(err.kind(), "not_found");
        assert_eq!(s.peek(id).expect("task").history.len(), 3);
    }

    #[test]
    fn delete_unknown_returns_none() {
        let mut s = store();
        assert!(s.delete(Uuid::new_v4()).is_none());
    }
}
