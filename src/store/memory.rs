//! In-memory repositories.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::{TaskFilter, TaskRepository, WorkerRepository};
use crate::error::RepositoryError;
use crate::tasks::model::Task;
use crate::workers::model::Worker;

/// Task and worker storage held in process memory.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    workers: RwLock<BTreeMap<String, Worker>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed workers.
    pub async fn with_workers(self, workers: impl IntoIterator<Item = Worker>) -> Self {
        {
            let mut map = self.workers.write().await;
            for worker in workers {
                map.insert(worker.id.clone(), worker);
            }
        }
        self
    }
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn create(&self, task: &Task) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(RepositoryError::Duplicate {
                entity: "task".into(),
                id: task.id.to_string(),
            });
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update(&self, task: &Task) -> Result<bool, RepositoryError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, RepositoryError> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl WorkerRepository for InMemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Worker>, RepositoryError> {
        Ok(self.workers.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Worker>, RepositoryError> {
        Ok(self.workers.read().await.values().cloned().collect())
    }

    async fn upsert(&self, worker: &Worker) -> Result<(), RepositoryError> {
        self.workers
            .write()
            .await
            .insert(worker.id.clone(), worker.clone());
        Ok(())
    }
}
