use thiserror::Error;
use uuid::Uuid;

use tp_core::state_store::StoreError;
use tp_core::types::TaskStatus;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn task_not_found(id: Uuid) -> Self {
        EngineError::NotFound { entity: "task", id }
    }

    pub fn subtask_not_found(id: Uuid) -> Self {
        EngineError::NotFound {
            entity: "subtask",
            id,
        }
    }

    pub fn workflow_not_found(id: Uuid) -> Self {
        EngineError::NotFound {
            entity: "workflow",
            id,
        }
    }

    /// Stable machine-readable kind used in command envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Persistence(_) => "persistence_failure",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
