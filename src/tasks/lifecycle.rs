//! Task lifecycle manager: owns the task state machine.
//!
//! ```text
//! created → pending → assigned → running → completed
//!              ↑         │  │        │
//!              │         │  └──────┐ └──→ failed
//!              │         ↓         ↓          │
//!              └──── (released)  failed ──────┘ (explicit retry)
//! ```
//!
//! Every change happens under the task's entity lock and is persisted before
//! its event is published. Load charged to a worker is released as soon as
//! the task reaches a terminal state.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::events::{EventBroadcaster, EventKind, TaskEvent};
use crate::locks::EntityLocks;
use crate::store::{TaskFilter, TaskRepository};
use crate::tasks::model::{Task, TaskDraft, TaskStatus};
use crate::workers::WorkerDirectory;
use crate::workflow::model::WorkflowStepResult;

pub struct TaskLifecycleManager {
    repo: Arc<dyn TaskRepository>,
    workers: Arc<WorkerDirectory>,
    events: Arc<EventBroadcaster>,
    locks: EntityLocks<Uuid>,
    max_history: usize,
}

impl TaskLifecycleManager {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        workers: Arc<WorkerDirectory>,
        events: Arc<EventBroadcaster>,
        max_history: usize,
    ) -> Self {
        Self {
            repo,
            workers,
            events,
            locks: EntityLocks::new(),
            max_history,
        }
    }

    // ── Locked primitives ───────────────────────────────────────────

    /// Acquire the task's entity lock.
    pub async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.locks.lock(&id).await
    }

    /// Drop the lock entry of a task that reached a terminal state or was
    /// deleted. An entry someone holds or waits on is kept; a later `lock`
    /// recreates it.
    pub async fn retire_lock(&self, id: Uuid) {
        self.locks.forget(&id).await;
    }

    pub async fn get(&self, id: Uuid) -> Result<Task> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(id).into())
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.repo.list(filter).await?)
    }

    /// Apply a transition, persist, and publish it. The caller holds the
    /// task lock.
    pub async fn commit(
        &self,
        task: &mut Task,
        to: TaskStatus,
        reason: Option<String>,
        mut extra: serde_json::Value,
    ) -> Result<TaskEvent> {
        let transition = task
            .transition_to(to, reason.clone(), self.max_history)
            .map_err(|e| OrchestratorError::conflict(task.id, e))?;
        self.persist(task).await?;

        if let (Some(map), Some(reason)) = (extra.as_object_mut(), reason) {
            map.entry("reason").or_insert(json!(reason));
        }

        info!(
            task_id = %task.id,
            from = %transition.from,
            to = %transition.to,
            worker_id = task.assigned_worker_id.as_deref().unwrap_or("-"),
            "Task transition"
        );
        Ok(self
            .events
            .publish(task.id, transition.from, transition.to, EventKind::Transition, extra)
            .await)
    }

    /// Persist a task without a status change. The caller holds the lock.
    pub async fn persist(&self, task: &Task) -> Result<()> {
        if !self.repo.update(task).await? {
            return Err(OrchestratorError::task_not_found(task.id).into());
        }
        Ok(())
    }

    /// Publish a non-transition event for a task in its current status.
    pub async fn notify(&self, task: &Task, kind: EventKind, extra: serde_json::Value) -> TaskEvent {
        self.events
            .publish(task.id, task.status, task.status, kind, extra)
            .await
    }

    /// Give back the load this task holds, if any. The caller holds the lock.
    pub async fn release_charge(&self, task: &mut Task) -> Result<()> {
        let Some(worker_id) = task.load_charged_to.take() else {
            return Ok(());
        };
        match self.workers.release(&worker_id, task.estimated_effort).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(task_id = %task.id, worker_id = %worker_id, "Charged worker no longer exists");
                Ok(())
            }
            Err(e) => {
                task.load_charged_to = Some(worker_id);
                Err(e)
            }
        }
    }

    /// Store a workflow step's latest result on its task and publish it.
    pub async fn record_step(&self, task_id: Uuid, result: &WorkflowStepResult, worker_id: &str) -> Result<()> {
        let _guard = self.lock(task_id).await;
        let mut task = self.get(task_id).await?;
        while task.step_results.len() <= result.step_index {
            let next = task.step_results.len();
            task.step_results.push(WorkflowStepResult::pending(next));
        }
        task.step_results[result.step_index] = result.clone();
        self.persist(&task).await?;
        self.notify(
            &task,
            EventKind::Step,
            json!({
                "step_index": result.step_index,
                "status": result.status,
                "attempt": result.attempts,
                "worker_id": worker_id,
                "error": result.error,
            }),
        )
        .await;
        Ok(())
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Record a new task and submit it (created → pending).
    pub async fn submit(&self, draft: TaskDraft) -> Result<Task> {
        let mut task = Task::from_draft(draft);
        let _guard = self.lock(task.id).await;
        self.repo.create(&task).await?;
        self.commit(&mut task, TaskStatus::Pending, Some("submitted".into()), json!({}))
            .await?;
        Ok(task)
    }

    /// The assigned worker begins (assigned → running).
    pub async fn start(&self, id: Uuid) -> Result<Task> {
        let _guard = self.lock(id).await;
        let mut task = self.get(id).await?;
        let worker = task.assigned_worker_id.clone();
        self.commit(
            &mut task,
            TaskStatus::Running,
            Some("started".into()),
            json!({ "worker_id": worker }),
        )
        .await?;
        Ok(task)
    }

    /// Output delivered (running → completed).
    pub async fn complete(&self, id: Uuid, output: String, actual_effort: Option<u32>) -> Result<Task> {
        let guard = self.lock(id).await;
        let mut task = self.get(id).await?;
        if task.status != TaskStatus::Running {
            return Err(OrchestratorError::conflict(
                id,
                format!("cannot complete a {} task", task.status),
            )
            .into());
        }
        task.output = Some(output);
        task.actual_effort = actual_effort;
        self.release_charge(&mut task).await?;
        let worker = task.assigned_worker_id.clone();
        self.commit(
            &mut task,
            TaskStatus::Completed,
            None,
            json!({ "worker_id": worker, "actual_effort": actual_effort }),
        )
        .await?;

        drop(guard);
        self.retire_lock(id).await;
        Ok(task)
    }

    /// An error surfaced (running|assigned → failed). Never auto-retried.
    pub async fn fail(&self, id: Uuid, message: impl Into<String>) -> Result<Task> {
        let guard = self.lock(id).await;
        let mut task = self.get(id).await?;
        self.fail_locked(&mut task, message.into()).await?;

        drop(guard);
        self.retire_lock(id).await;
        Ok(task)
    }

    /// Fail a task whose lock the caller holds.
    pub async fn fail_locked(&self, task: &mut Task, message: String) -> Result<TaskEvent> {
        if !task.status.can_transition_to(TaskStatus::Failed) {
            return Err(OrchestratorError::conflict(
                task.id,
                format!("cannot fail a {} task", task.status),
            )
            .into());
        }
        task.error_message = Some(message.clone());
        self.release_charge(task).await?;
        let worker = task.assigned_worker_id.clone();
        self.commit(
            task,
            TaskStatus::Failed,
            Some(message.clone()),
            json!({ "worker_id": worker, "error": message }),
        )
        .await
    }

    /// Explicit retry (failed → pending). Clears the worker binding and
    /// keeps assignment and transition history.
    pub async fn retry(&self, id: Uuid) -> Result<Task> {
        let _guard = self.lock(id).await;
        let mut task = self.get(id).await?;
        if task.status != TaskStatus::Failed {
            return Err(OrchestratorError::conflict(
                id,
                format!("only failed tasks can be retried, task is {}", task.status),
            )
            .into());
        }

        self.release_charge(&mut task).await?;
        let previous_worker = task.assigned_worker_id.take();
        task.error_message = None;
        task.output = None;
        task.started_at = None;
        task.completed_at = None;
        task.step_results.clear();

        self.commit(
            &mut task,
            TaskStatus::Pending,
            Some("retry".into()),
            json!({ "previous_worker_id": previous_worker }),
        )
        .await?;
        Ok(task)
    }

    /// Remove a task. Rejected while it is running.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let guard = self.lock(id).await;
        let mut task = self.get(id).await?;
        if task.status == TaskStatus::Running {
            return Err(OrchestratorError::conflict(id, "cannot delete a running task").into());
        }

        self.release_charge(&mut task).await?;
        self.repo.delete(id).await?;
        self.notify(&task, EventKind::Deleted, json!({ "deleted": true }))
            .await;
        info!(task_id = %id, status = %task.status, "Task deleted");

        drop(guard);
        self.retire_lock(id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::workers::Worker;

    struct Fixture {
        lifecycle: TaskLifecycleManager,
        workers: Arc<WorkerDirectory>,
        events: Arc<EventBroadcaster>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(
            InMemoryStore::new()
                .with_workers([Worker::new("w1", "dev").with_skills(["rust"])])
                .await,
        );
        let workers = Arc::new(WorkerDirectory::new(store.clone()));
        let events = EventBroadcaster::new(64);
        Fixture {
            lifecycle: TaskLifecycleManager::new(store, workers.clone(), events.clone(), 200),
            workers,
            events,
        }
    }

    /// Bind a pending task to w1 the way the coordinator does.
    async fn bind(f: &Fixture, id: Uuid) {
        let _guard = f.lifecycle.lock(id).await;
        let mut task = f.lifecycle.get(id).await.unwrap();
        f.workers.try_reserve("w1", task.estimated_effort).await.unwrap().unwrap();
        task.assigned_worker_id = Some("w1".into());
        task.load_charged_to = Some("w1".into());
        f.lifecycle
            .commit(&mut task, TaskStatus::Assigned, None, json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn submit_moves_to_pending_and_emits() {
        let f = fixture().await;
        let (_, mut rx) = f.events.subscribe_channel().await;
        let task = f.lifecycle.submit(TaskDraft::new("t")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.previous_state, TaskStatus::Created);
        assert_eq!(event.new_state, TaskStatus::Pending);
        assert_eq!(event.extra["reason"], "submitted");
    }

    #[tokio::test]
    async fn full_lifecycle_releases_load() {
        let f = fixture().await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("t").with_effort(3))
            .await
            .unwrap();
        bind(&f, task.id).await;
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 3);

        f.lifecycle.start(task.id).await.unwrap();
        let done = f
            .lifecycle
            .complete(task.id, "shipped".into(), Some(4))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.assigned_worker_id.as_deref(), Some("w1"));
        assert!(done.load_charged_to.is_none());
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn retry_clears_worker_and_keeps_history() {
        let f = fixture().await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("t").with_effort(2))
            .await
            .unwrap();
        bind(&f, task.id).await;
        f.lifecycle.start(task.id).await.unwrap();
        let failed = f.lifecycle.fail(task.id, "compiler exploded").await.unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("compiler exploded"));
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 0);

        let retried = f.lifecycle.retry(task.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert!(retried.assigned_worker_id.is_none());
        assert!(retried.error_message.is_none());
        assert_eq!(retried.transitions.len(), 5);
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn retry_releases_a_charge_still_held() {
        let f = fixture().await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("t").with_effort(2))
            .await
            .unwrap();
        bind(&f, task.id).await;

        // A failed task that still carries a charge, e.g. written by an
        // older store.
        {
            let _guard = f.lifecycle.lock(task.id).await;
            let mut t = f.lifecycle.get(task.id).await.unwrap();
            t.transition_to(TaskStatus::Failed, None, 200).unwrap();
            f.lifecycle.persist(&t).await.unwrap();
        }
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 2);

        f.lifecycle.retry(task.id).await.unwrap();
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn retry_requires_failed() {
        let f = fixture().await;
        let task = f.lifecycle.submit(TaskDraft::new("t")).await.unwrap();
        assert!(f.lifecycle.retry(task.id).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn delete_rejected_while_running() {
        let f = fixture().await;
        let task = f.lifecycle.submit(TaskDraft::new("t")).await.unwrap();
        bind(&f, task.id).await;
        f.lifecycle.start(task.id).await.unwrap();
        assert!(f.lifecycle.delete(task.id).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn delete_assigned_releases_load() {
        let f = fixture().await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("t").with_effort(2))
            .await
            .unwrap();
        bind(&f, task.id).await;
        f.lifecycle.delete(task.id).await.unwrap();
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 0);
        assert!(f.lifecycle.get(task.id).await.unwrap_err().is_not_found());
        assert!(f.lifecycle.delete(task.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn terminal_tasks_do_not_keep_lock_entries() {
        let f = fixture().await;
        let done = f.lifecycle.submit(TaskDraft::new("done")).await.unwrap();
        bind(&f, done.id).await;
        f.lifecycle.start(done.id).await.unwrap();
        f.lifecycle.complete(done.id, "ok".into(), None).await.unwrap();

        let broken = f.lifecycle.submit(TaskDraft::new("broken")).await.unwrap();
        f.lifecycle.fail(broken.id, "nope").await.unwrap_err();
        assert_eq!(f.lifecycle.locks.len().await, 1);

        let pending = f.lifecycle.get(broken.id).await.unwrap();
        assert_eq!(pending.status, TaskStatus::Pending);
        bind(&f, broken.id).await;
        f.lifecycle.fail(broken.id, "nope").await.unwrap();
        assert_eq!(f.lifecycle.locks.len().await, 0);

        // A retried task gets a fresh entry on demand.
        f.lifecycle.retry(broken.id).await.unwrap();
        assert_eq!(f.lifecycle.get(broken.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn complete_requires_running() {
        let f = fixture().await;
        let task = f.lifecycle.submit(TaskDraft::new("t")).await.unwrap();
        let err = f
            .lifecycle
            .complete(task.id, "early".into(), None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
