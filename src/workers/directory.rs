//! Worker directory: the only writer of worker load and active flags.
//!
//! Each mutation runs under the worker's entity lock, so load updates from
//! concurrent assignments, completions and rebalance moves never interleave.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::locks::EntityLocks;
use crate::store::WorkerRepository;
use crate::workers::model::Worker;

pub struct WorkerDirectory {
    repo: Arc<dyn WorkerRepository>,
    locks: EntityLocks<String>,
    default_capacity: Option<u32>,
}

impl WorkerDirectory {
    pub fn new(repo: Arc<dyn WorkerRepository>) -> Self {
        Self {
            repo,
            locks: EntityLocks::new(),
            default_capacity: None,
        }
    }

    /// Capacity given to registered workers that do not carry one.
    pub fn with_default_capacity(mut self, capacity: u32) -> Self {
        self.default_capacity = Some(capacity);
        self
    }

    /// Add or replace a worker profile. Load already recorded for a known
    /// worker is kept.
    pub async fn register(&self, mut worker: Worker) -> Result<Worker> {
        let _guard = self.locks.lock(&worker.id).await;
        if worker.capacity.is_none() {
            worker.capacity = self.default_capacity;
        }
        if let Some(existing) = self.repo.get(&worker.id).await? {
            worker.current_load = existing.current_load;
        }
        self.repo.upsert(&worker).await?;
        info!(worker_id = %worker.id, role = %worker.role, "Worker registered");
        Ok(worker)
    }

    /// All workers, ordered by id.
    pub async fn list(&self) -> Result<Vec<Worker>> {
        Ok(self.repo.list().await?)
    }

    /// Active workers, ordered by id.
    pub async fn list_active(&self) -> Result<Vec<Worker>> {
        let mut workers = self.repo.list().await?;
        workers.retain(|w| w.active);
        Ok(workers)
    }

    pub async fn get(&self, id: &str) -> Result<Worker> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::worker_not_found(id).into())
    }

    /// Apply a signed load change. Load never goes below zero.
    pub async fn update_load(&self, id: &str, delta: i64) -> Result<Worker> {
        let _guard = self.locks.lock(&id.to_string()).await;
        let mut worker = self.get(id).await?;

        let next = i64::from(worker.current_load) + delta;
        if next < 0 {
            warn!(worker_id = %id, load = worker.current_load, delta, "Load would go negative, clamping");
        }
        worker.current_load = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
        self.repo.upsert(&worker).await?;

        debug!(worker_id = %id, delta, load = worker.current_load, "Worker load updated");
        Ok(worker)
    }

    /// Charge `effort` to the worker if it is active and has room.
    ///
    /// Returns the updated worker, or `None` if the reservation was refused.
    /// The capacity check and the increment happen under one lock.
    pub async fn try_reserve(&self, id: &str, effort: u32) -> Result<Option<Worker>> {
        self.try_reserve_within(id, effort, None).await
    }

    /// Like [`try_reserve`](Self::try_reserve), additionally refusing if the
    /// resulting load would exceed `ceiling`.
    pub async fn try_reserve_within(
        &self,
        id: &str,
        effort: u32,
        ceiling: Option<u32>,
    ) -> Result<Option<Worker>> {
        let _guard = self.locks.lock(&id.to_string()).await;
        let mut worker = self.get(id).await?;

        let over_ceiling = ceiling.is_some_and(|c| worker.current_load.saturating_add(effort) > c);
        if !worker.active || !worker.has_room_for(effort) || over_ceiling {
            debug!(
                worker_id = %id,
                load = worker.current_load,
                capacity = ?worker.capacity,
                effort,
                "Reservation refused"
            );
            return Ok(None);
        }

        worker.current_load += effort;
        self.repo.upsert(&worker).await?;
        Ok(Some(worker))
    }

    /// Give back `effort` previously reserved.
    pub async fn release(&self, id: &str, effort: u32) -> Result<Worker> {
        self.update_load(id, -i64::from(effort)).await
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<Worker> {
        let _guard = self.locks.lock(&id.to_string()).await;
        let mut worker = self.get(id).await?;
        if worker.active != active {
            worker.active = active;
            self.repo.upsert(&worker).await?;
            info!(worker_id = %id, active, "Worker availability changed");
        }
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    async fn directory(workers: Vec<Worker>) -> WorkerDirectory {
        let store = InMemoryStore::new().with_workers(workers).await;
        WorkerDirectory::new(Arc::new(store))
    }

    #[tokio::test]
    async fn list_active_skips_inactive() {
        let dir = directory(vec![
            Worker::new("w1", "dev"),
            Worker::new("w2", "dev").inactive(),
        ])
        .await;
        let active = dir.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "w1");
    }

    #[tokio::test]
    async fn unknown_worker_is_not_found() {
        let dir = directory(vec![]).await;
        assert!(dir.get("ghost").await.unwrap_err().is_not_found());
        assert!(dir.update_load("ghost", 1).await.unwrap_err().is_not_found());
        assert!(dir.set_active("ghost", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_load_applies_delta() {
        let dir = directory(vec![Worker::new("w1", "dev")]).await;
        dir.update_load("w1", 5).await.unwrap();
        let w = dir.update_load("w1", -2).await.unwrap();
        assert_eq!(w.current_load, 3);
        let w = dir.update_load("w1", -10).await.unwrap();
        assert_eq!(w.current_load, 0);
    }

    #[tokio::test]
    async fn concurrent_reservations_respect_capacity() {
        let dir = Arc::new(directory(vec![Worker::new("w1", "dev").with_capacity(3)]).await);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let dir = dir.clone();
            handles.push(tokio::spawn(async move { dir.try_reserve("w1", 1).await }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(dir.get("w1").await.unwrap().current_load, 3);
    }

    #[tokio::test]
    async fn inactive_worker_refuses_reservation() {
        let dir = directory(vec![Worker::new("w1", "dev")]).await;
        dir.set_active("w1", false).await.unwrap();
        assert!(dir.try_reserve("w1", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ceiling_refuses_reservation() {
        let dir = directory(vec![Worker::new("w1", "dev").with_load(3)]).await;
        assert!(dir.try_reserve_within("w1", 2, Some(4)).await.unwrap().is_none());
        let w = dir.try_reserve_within("w1", 1, Some(4)).await.unwrap().unwrap();
        assert_eq!(w.current_load, 4);
    }

    #[tokio::test]
    async fn register_keeps_existing_load() {
        let dir = directory(vec![Worker::new("w1", "dev")]).await;
        dir.update_load("w1", 4).await.unwrap();
        let w = dir
            .register(Worker::new("w1", "lead").with_skills(["rust"]))
            .await
            .unwrap();
        assert_eq!(w.current_load, 4);
        assert_eq!(dir.get("w1").await.unwrap().role, "lead");
    }

    #[tokio::test]
    async fn register_fills_in_default_capacity() {
        let dir = directory(vec![]).await.with_default_capacity(2);
        let plain = dir.register(Worker::new("w1", "dev")).await.unwrap();
        assert_eq!(plain.capacity, Some(2));
        let sized = dir.register(Worker::new("w2", "dev").with_capacity(5)).await.unwrap();
        assert_eq!(sized.capacity, Some(5));

        assert!(dir.try_reserve("w1", 2).await.unwrap().is_some());
        assert!(dir.try_reserve("w1", 1).await.unwrap().is_none());
    }
}
