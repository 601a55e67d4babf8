use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::trace;

use crate::types::{SessionArchive, TaskState};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Persistence collaborator for engine state.
///
/// `read_*` returns `Ok(None)` when nothing has been written yet.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read_state(&self) -> Result<Option<TaskState>, StoreError>;
    async fn write_state(&self, state: &TaskState) -> Result<(), StoreError>;
    async fn read_archive(&self) -> Result<Option<SessionArchive>, StoreError>;
    async fn write_archive(&self, archive: &SessionArchive) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// FileStateStore
// ---------------------------------------------------------------------------

const STATE_FILE: &str = "state.json";
const ARCHIVE_FILE: &str = "archive.json";

/// JSON-file persistence under a single directory
/// (defaults to `~/.config/taskpilot/`).
#[derive(Debug, Clone)]
pub struct FileStateStore {
    base_dir: PathBuf,
}

impl FileStateStore {
    /// Create a store with the default directory (`~/.config/taskpilot/`).
    pub fn default_path() -> Self {
        let base = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("taskpilot");
        Self { base_dir: base }
    }

    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, StoreError> {
        let path = self.base_dir.join(name);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Write to a sibling temp file, then rename over the target.
    async fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let json = serde_json::to_string_pretty(value)?;
        let path = self.base_dir.join(name);
        let tmp = self.base_dir.join(format!("{name}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        trace!(path = %path.display(), "state file written");
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read_state(&self) -> Result<Option<TaskState>, StoreError> {
        self.read_json(STATE_FILE).await
    }

    async fn write_state(&self, state: &TaskState) -> Result<(), StoreError> {
        self.write_json(STATE_FILE, state).await
    }

    async fn read_archive(&self) -> Result<Option<SessionArchive>, StoreError> {
        self.read_json(ARCHIVE_FILE).await
    }

    async fn write_archive(&self, archive: &SessionArchive) -> Result<(), StoreError> {
        self.write_json(ARCHIVE_FILE, archive).await
    }
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-process store, used by tests and embedders that do not persist.
///
/// `set_failing(true)` makes every call fail with an I/O error.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<TaskState>>,
    archive: Mutex<Option<SessionArchive>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: TaskState) -> Self {
        let store = Self::default();
        *store.state.lock().expect("MemoryStateStore lock poisoned") = Some(state);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful `write_state` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<TaskState> {
        self.state
            .lock()
            .expect("MemoryStateStore lock poisoned")
            .clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other(
                "memory store configured to fail",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read_state(&self) -> Result<Option<TaskState>, StoreError> {
        self.check()?;
        Ok(self.snapshot())
    }

    async fn write_state(&self, state: &TaskState) -> Result<(), StoreError> {
        self.check()?;
        *self.state.lock().expect("MemoryStateStore lock poisoned") = Some(state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_archive(&self) -> Result<Option<SessionArchive>, StoreError> {
        self.check()?;
        Ok(self
            .archive
            .lock()
            .expect("MemoryStateStore lock poisoned")
            .clone())
    }

    async fn write_archive(&self, archive: &SessionArchive) -> Result<(), StoreError> {
        self.check()?;
        *self.archive.lock().expect("MemoryStateStore lock poisoned") = Some(archive.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Task;

    fn temp_store() -> (tempfile::TempDir, FileStateStore) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileStateStore::new(dir.path().join("state"));
        (dir, store)
    }

    #[tokio::test]
    async fn read_missing_state_returns_none() {
        let (_dir, store) = temp_store();
        let state = store.read_state().await.expect("read should succeed");
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn write_then_read_state() {
        let (_dir, store) = temp_store();
        let mut state = TaskState::empty();
        state.tasks.push(Task::new("write the parser"));
        state.auto_progression_enabled = true;

        store.write_state(&state).await.expect("write should succeed");
        let loaded = store
            .read_state()
            .await
            .expect("read should succeed")
            .expect("state should exist");

        assert_eq!(loaded.session_id, state.session_id);
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].content, "write the parser");
        assert!(loaded.auto_progression_enabled);
    }

    #[tokio::test]
    async fn archive_roundtrip_keyed_by_session() {
        let (_dir, store) = temp_store();
        let first = TaskState::empty();
        let second = TaskState::empty();
        let mut archive = SessionArchive::default();
        archive.insert(first.clone());
        archive.insert(second.clone());

        store.write_archive(&archive).await.expect("write archive");
        let loaded = store
            .read_archive()
            .await
            .expect("read archive")
            .expect("archive should exist");
        assert_eq!(loaded.len(), 2);
        assert!(loaded.sessions.contains_key(&first.session_id));
        assert!(loaded.sessions.contains_key(&second.session_id));
    }

    #[tokio::test]
    async fn corrupt_state_file_is_serde_error() {
        let (dir, store) = temp_store();
        let base = dir.path().join("state");
        std::fs::create_dir_all(&base).expect("mkdir");
        std::fs::write(base.join(STATE_FILE), "{ not json").expect("write");

        let err = store.read_state().await.expect_err("should fail");
        assert!(matches!(err, StoreError::Serde(_)));
    }

    #[tokio::test]
    async fn memory_store_failure_injection() {
        let store = MemoryStateStore::new();
        store.set_failing(true);
        assert!(store.write_state(&TaskState::empty()).await.is_err());
        assert_eq!(store.write_count(), 0);

        store.set_failing(false);
        store
            .write_state(&TaskState::empty())
            .await
            .expect("write should succeed");
        assert_eq!(store.write_count(), 1);
        assert!(store.snapshot().is_some());
    }
}
