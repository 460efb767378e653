//! Repository traits the orchestration core consumes.
//!
//! Durable storage lives outside the core; anything implementing these
//! traits can back it. `InMemoryStore` is the bundled reference backend.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::tasks::model::{Task, TaskStatus};
use crate::workers::model::Worker;

/// Filter for listing tasks. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub assigned_worker_id: Option<String>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    pub fn with_statuses(statuses: impl Into<Vec<TaskStatus>>) -> Self {
        Self {
            statuses: Some(statuses.into()),
            ..Default::default()
        }
    }

    pub fn for_worker(worker_id: impl Into<String>) -> Self {
        Self {
            assigned_worker_id: Some(worker_id.into()),
            ..Default::default()
        }
    }

    /// Narrow an existing filter to one worker's tasks.
    pub fn assigned_to(mut self, worker_id: impl Into<String>) -> Self {
        self.assigned_worker_id = Some(worker_id.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(worker_id) = &self.assigned_worker_id {
            if task.assigned_worker_id.as_ref() != Some(worker_id) {
                return false;
            }
        }
        true
    }
}

/// Durable task storage.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new task.
    async fn create(&self, task: &Task) -> Result<(), RepositoryError>;

    /// Get a task by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, RepositoryError>;

    /// Replace a stored task. Returns false if it does not exist.
    async fn update(&self, task: &Task) -> Result<bool, RepositoryError>;

    /// Remove a task. Returns false if it did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError>;

    /// List tasks matching a filter, oldest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, RepositoryError>;
}

/// Durable worker storage.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Get a worker by ID.
    async fn get(&self, id: &str) -> Result<Option<Worker>, RepositoryError>;

    /// List all workers, ordered by ID.
    async fn list(&self) -> Result<Vec<Worker>, RepositoryError>;

    /// Insert or replace a worker.
    async fn upsert(&self, worker: &Worker) -> Result<(), RepositoryError>;
}
