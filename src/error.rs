//! Error types for the orchestration core.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl Error {
    /// The orchestration failure kind, if this is one.
    pub fn kind(&self) -> Option<&OrchestratorError> {
        match self {
            Self::Orchestrator(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), Some(OrchestratorError::NotFound { .. }))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.kind(), Some(OrchestratorError::Conflict { .. }))
    }

    pub fn is_unassignable(&self) -> bool {
        matches!(self.kind(), Some(OrchestratorError::Unassignable { .. }))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failures reported by a task or worker repository.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity already exists: {entity} with id {id}")]
    Duplicate { entity: String, id: String },
}

/// Orchestration failure kinds surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Task {task_id} is unassignable: {reason}")]
    Unassignable { task_id: Uuid, reason: String },

    #[error("Conflict on task {task_id}: {reason}")]
    Conflict { task_id: Uuid, reason: String },

    #[error("Step {step_index} of task {task_id} failed: {reason}")]
    StepExecution {
        task_id: Uuid,
        step_index: usize,
        reason: String,
    },

    #[error("Step {step_index} of task {task_id} timed out after {timeout:?}")]
    Timeout {
        task_id: Uuid,
        step_index: usize,
        timeout: Duration,
    },

    #[error("Invalid workflow plan for task {task_id}: {reason}")]
    InvalidPlan { task_id: Uuid, reason: String },
}

impl OrchestratorError {
    pub fn task_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "Task",
            id: id.to_string(),
        }
    }

    pub fn worker_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "Worker",
            id: id.to_string(),
        }
    }

    pub fn conflict(task_id: Uuid, reason: impl Into<String>) -> Self {
        Self::Conflict {
            task_id,
            reason: reason.into(),
        }
    }
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_helpers() {
        let err: Error = OrchestratorError::task_not_found(Uuid::nil()).into();
        assert!(err.is_not_found());
        assert!(!err.is_conflict());

        let err: Error = OrchestratorError::conflict(Uuid::nil(), "running").into();
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            format!("Conflict on task {}: running", Uuid::nil())
        );
    }

    #[test]
    fn repository_error_is_not_a_kind() {
        let err: Error = RepositoryError::Query("boom".into()).into();
        assert!(err.kind().is_none());
    }
}
