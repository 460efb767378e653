//! Assignment coordinator: picks a worker for a task and binds them.
//!
//! All binding happens under the task's entity lock, so concurrent
//! `assign` calls for one task serialize and the second sees it already
//! assigned. Load is charged through [`WorkerDirectory::try_reserve`], whose
//! capacity check is atomic per worker: when two tasks race for one free
//! slot, the loser falls through to the next-ranked candidate or stays
//! pending.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::events::EventKind;
use crate::scoring::{self, Candidate, ScoringEngine};
use crate::tasks::model::{Assignment, Task, TaskStatus};
use crate::tasks::TaskLifecycleManager;
use crate::workers::{Worker, WorkerDirectory};

pub struct AssignmentCoordinator {
    lifecycle: Arc<TaskLifecycleManager>,
    workers: Arc<WorkerDirectory>,
    scorer: Arc<dyn ScoringEngine>,
    require_skill_match: bool,
}

impl AssignmentCoordinator {
    pub fn new(
        lifecycle: Arc<TaskLifecycleManager>,
        workers: Arc<WorkerDirectory>,
        scorer: Arc<dyn ScoringEngine>,
        require_skill_match: bool,
    ) -> Self {
        Self {
            lifecycle,
            workers,
            scorer,
            require_skill_match,
        }
    }

    pub fn scorer(&self) -> &dyn ScoringEngine {
        self.scorer.as_ref()
    }

    /// Eligible active workers for `task`, best first.
    pub async fn rank(&self, task: &Task) -> Result<Vec<Candidate>> {
        let snapshot = self.workers.list_active().await?;
        Ok(scoring::rank(
            self.scorer.as_ref(),
            &snapshot,
            task,
            self.require_skill_match,
        ))
    }

    /// Best available score for `task`, if anyone is eligible.
    pub async fn best_score(&self, task: &Task) -> Result<Option<f64>> {
        Ok(self.rank(task).await?.first().map(|c| c.score))
    }

    /// Score of the task's current worker, as if the task were not yet
    /// counted in that worker's load.
    pub fn score_without_self(&self, worker: &Worker, task: &Task) -> f64 {
        let mut unloaded = worker.clone();
        if task.load_charged_to.as_deref() == Some(worker.id.as_str()) {
            unloaded.current_load = unloaded.current_load.saturating_sub(task.estimated_effort);
        }
        self.scorer.score(&unloaded, task)
    }

    /// Assign a pending task to the best eligible worker.
    ///
    /// Fails with `Unassignable` if nobody can take it; the task then stays
    /// pending.
    pub async fn assign(&self, task_id: Uuid) -> Result<Assignment> {
        let _guard = self.lifecycle.lock(task_id).await;
        let mut task = self.lifecycle.get(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(OrchestratorError::conflict(
                task_id,
                format!("cannot assign a {} task", task.status),
            )
            .into());
        }

        let candidates = self.rank(&task).await?;
        match self.bind_first(&mut task, &candidates, None).await? {
            Some(assignment) => Ok(assignment),
            None => {
                debug!(task_id = %task_id, candidates = candidates.len(), "No worker could take task");
                Err(unassignable(&task, candidates.is_empty()))
            }
        }
    }

    /// Assign a pending task to a worker whose resulting load stays at or
    /// under `ceiling`. Returns `None` if nobody qualifies.
    pub async fn assign_within(&self, task_id: Uuid, ceiling: u32) -> Result<Option<Assignment>> {
        let _guard = self.lifecycle.lock(task_id).await;
        let mut task = self.lifecycle.get(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Ok(None);
        }
        let candidates = self.rank(&task).await?;
        self.bind_first(&mut task, &candidates, Some(ceiling)).await
    }

    /// Release the task's current worker and compute a fresh assignment.
    ///
    /// If no worker is eligible the task returns to pending and
    /// `Unassignable` is reported.
    pub async fn reassign(&self, task_id: Uuid) -> Result<Assignment> {
        let _guard = self.lifecycle.lock(task_id).await;
        let mut task = self.lifecycle.get(task_id).await?;
        if task.status != TaskStatus::Assigned {
            return Err(OrchestratorError::conflict(
                task_id,
                format!("cannot reassign a {} task", task.status),
            )
            .into());
        }

        let previous = task.assigned_worker_id.clone();
        self.lifecycle.release_charge(&mut task).await?;
        self.lifecycle.persist(&task).await?;

        let candidates = self.rank(&task).await?;
        for candidate in &candidates {
            if let Some(worker) = self
                .workers
                .try_reserve(&candidate.worker.id, task.estimated_effort)
                .await?
            {
                let assignment = self
                    .rebind(&mut task, candidate, worker, previous.clone())
                    .await?;
                return Ok(assignment);
            }
        }

        task.assigned_worker_id = None;
        self.lifecycle
            .commit(
                &mut task,
                TaskStatus::Pending,
                Some("released".into()),
                json!({ "previous_worker_id": previous }),
            )
            .await?;
        Err(unassignable(&task, candidates.is_empty()))
    }

    /// Move an assigned task from `from` to `to` if that strictly improves
    /// its score and keeps `to` at or under `ceiling`.
    ///
    /// Conditions are re-checked under the task lock; `None` means the move
    /// no longer applies and nothing changed.
    pub async fn move_task(
        &self,
        task_id: Uuid,
        from: &str,
        to: &str,
        ceiling: Option<u32>,
    ) -> Result<Option<Assignment>> {
        let _guard = self.lifecycle.lock(task_id).await;
        let mut task = self.lifecycle.get(task_id).await?;
        if task.status != TaskStatus::Assigned || task.assigned_worker_id.as_deref() != Some(from) || from == to {
            return Ok(None);
        }

        let source = self.workers.get(from).await?;
        let target = self.workers.get(to).await?;
        if !scoring::is_eligible(&target, &task, self.require_skill_match) {
            return Ok(None);
        }
        let current = self.score_without_self(&source, &task);
        let candidate = Candidate {
            score: self.scorer.score(&target, &task),
            worker: target,
        };
        if candidate.score <= current {
            return Ok(None);
        }

        let Some(reserved) = self
            .workers
            .try_reserve_within(to, task.estimated_effort, ceiling)
            .await?
        else {
            return Ok(None);
        };
        self.lifecycle.release_charge(&mut task).await?;
        let assignment = self
            .rebind(&mut task, &candidate, reserved, Some(from.to_string()))
            .await?;
        Ok(Some(assignment))
    }

    /// Rank workers for a subset of the task's skills.
    pub async fn rank_scoped(
        &self,
        task: &Task,
        skills: &BTreeSet<String>,
        effort: u32,
    ) -> Result<Vec<Candidate>> {
        self.rank(&scoped_task(task, skills, effort)).await
    }

    /// Pick a worker for one workflow step, scoped to `skills`. Workers in
    /// `avoid` are used only if nobody else is eligible. No load is charged.
    pub async fn select_for_step(
        &self,
        task: &Task,
        skills: &BTreeSet<String>,
        effort: u32,
        avoid: &[String],
    ) -> Result<Assignment> {
        let scoped = scoped_task(task, skills, effort);
        let candidates = self.rank(&scoped).await?;
        let chosen = candidates
            .iter()
            .find(|c| !avoid.contains(&c.worker.id))
            .or_else(|| candidates.first())
            .ok_or_else(|| unassignable(&scoped, true))?;

        Ok(Assignment {
            task_id: task.id,
            worker_id: chosen.worker.id.clone(),
            score: chosen.score,
            timestamp: Utc::now(),
            rationale: chosen.rationale(&scoped),
        })
    }

    /// Bind the pending task to the first candidate that accepts the
    /// reservation. Caller holds the task lock.
    async fn bind_first(
        &self,
        task: &mut Task,
        candidates: &[Candidate],
        ceiling: Option<u32>,
    ) -> Result<Option<Assignment>> {
        for candidate in candidates {
            let reserved = self
                .workers
                .try_reserve_within(&candidate.worker.id, task.estimated_effort, ceiling)
                .await?;
            if reserved.is_none() {
                continue;
            }

            let assignment = record(task, candidate);
            task.assigned_worker_id = Some(candidate.worker.id.clone());
            task.load_charged_to = Some(candidate.worker.id.clone());
            self.lifecycle
                .commit(
                    task,
                    TaskStatus::Assigned,
                    None,
                    json!({
                        "worker_id": assignment.worker_id,
                        "score": assignment.score,
                        "rationale": assignment.rationale,
                    }),
                )
                .await?;
            info!(
                task_id = %task.id,
                worker_id = %assignment.worker_id,
                score = assignment.score,
                "Task assigned"
            );
            return Ok(Some(assignment));
        }
        Ok(None)
    }

    /// Record a new assignment for an already-assigned task whose load has
    /// been moved to `worker`. Caller holds the task lock.
    async fn rebind(
        &self,
        task: &mut Task,
        candidate: &Candidate,
        worker: Worker,
        previous: Option<String>,
    ) -> Result<Assignment> {
        let assignment = record(task, candidate);
        task.assigned_worker_id = Some(worker.id.clone());
        task.load_charged_to = Some(worker.id.clone());
        self.lifecycle.persist(task).await?;
        self.lifecycle
            .notify(
                task,
                EventKind::Reassigned,
                json!({
                    "previous_worker_id": previous,
                    "worker_id": worker.id,
                    "score": assignment.score,
                }),
            )
            .await;
        info!(
            task_id = %task.id,
            from = previous.as_deref().unwrap_or("-"),
            to = %worker.id,
            score = assignment.score,
            "Task reassigned"
        );
        Ok(assignment)
    }
}

fn record(task: &mut Task, candidate: &Candidate) -> Assignment {
    let assignment = Assignment {
        task_id: task.id,
        worker_id: candidate.worker.id.clone(),
        score: candidate.score,
        timestamp: Utc::now(),
        rationale: candidate.rationale(task),
    };
    task.assignments.push(assignment.clone());
    assignment
}

fn scoped_task(task: &Task, skills: &BTreeSet<String>, effort: u32) -> Task {
    let mut scoped = task.clone();
    scoped.required_skills = skills.clone();
    scoped.estimated_effort = effort;
    scoped
}

fn unassignable(task: &Task, nobody_eligible: bool) -> crate::error::Error {
    let reason = if nobody_eligible {
        "no eligible active worker".to_string()
    } else {
        "every eligible worker is at capacity".to_string()
    };
    OrchestratorError::Unassignable {
        task_id: task.id,
        reason,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBroadcaster;
    use crate::scoring::SkillMatchScorer;
    use crate::store::InMemoryStore;
    use crate::tasks::model::TaskDraft;

    struct Fixture {
        coordinator: Arc<AssignmentCoordinator>,
        lifecycle: Arc<TaskLifecycleManager>,
        workers: Arc<WorkerDirectory>,
    }

    async fn fixture(workers: Vec<Worker>) -> Fixture {
        let store = Arc::new(InMemoryStore::new().with_workers(workers).await);
        let directory = Arc::new(WorkerDirectory::new(store.clone()));
        let lifecycle = Arc::new(TaskLifecycleManager::new(
            store,
            directory.clone(),
            EventBroadcaster::new(64),
            200,
        ));
        let coordinator = Arc::new(AssignmentCoordinator::new(
            lifecycle.clone(),
            directory.clone(),
            Arc::new(SkillMatchScorer::default()),
            true,
        ));
        Fixture {
            coordinator,
            lifecycle,
            workers: directory,
        }
    }

    #[tokio::test]
    async fn assigns_best_skill_match() {
        let f = fixture(vec![
            Worker::new("w1", "frontend").with_skills(["frontend", "css"]),
            Worker::new("w2", "backend").with_skills(["backend"]),
        ])
        .await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("T1").with_skills(["frontend", "css"]).with_effort(2))
            .await
            .unwrap();

        let assignment = f.coordinator.assign(task.id).await.unwrap();
        assert_eq!(assignment.worker_id, "w1");

        let stored = f.lifecycle.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert_eq!(stored.assigned_worker_id.as_deref(), Some("w1"));
        assert_eq!(stored.active_assignment(), Some(&assignment));
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 2);
    }

    #[tokio::test]
    async fn second_assign_is_conflict() {
        let f = fixture(vec![Worker::new("w1", "dev").with_skills(["rust"])]).await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("t").with_skills(["rust"]))
            .await
            .unwrap();

        let (a, b) = tokio::join!(f.coordinator.assign(task.id), f.coordinator.assign(task.id));
        assert!(a.is_ok() != b.is_ok());
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 1);
        assert_eq!(f.lifecycle.get(task.id).await.unwrap().assignments.len(), 1);
    }

    #[tokio::test]
    async fn racing_tasks_for_one_slot() {
        let f = fixture(vec![
            Worker::new("w1", "dev").with_skills(["rust"]).with_capacity(1),
            Worker::new("w2", "dev").with_skills(["go"]),
        ])
        .await;
        let t1 = f
            .lifecycle
            .submit(TaskDraft::new("t1").with_skills(["rust"]))
            .await
            .unwrap();
        let t2 = f
            .lifecycle
            .submit(TaskDraft::new("t2").with_skills(["rust"]))
            .await
            .unwrap();

        let (c1, c2) = (f.coordinator.clone(), f.coordinator.clone());
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { c1.assign(t1.id).await }),
            tokio::spawn(async move { c2.assign(t2.id).await }),
        );
        let results = [r1.unwrap(), r2.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(loser.is_unassignable());

        let pending = f
            .lifecycle
            .list(&crate::store::TaskFilter::with_status(TaskStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn nobody_eligible_leaves_pending() {
        let f = fixture(vec![Worker::new("w1", "dev").with_skills(["go"])]).await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("t").with_skills(["rust"]))
            .await
            .unwrap();
        assert!(f.coordinator.assign(task.id).await.unwrap_err().is_unassignable());
        assert_eq!(f.lifecycle.get(task.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn reassign_moves_load_and_appends_record() {
        let f = fixture(vec![
            Worker::new("a", "dev").with_skills(["rust"]),
            Worker::new("b", "dev").with_skills(["rust"]),
        ])
        .await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("t").with_skills(["rust"]).with_effort(2))
            .await
            .unwrap();
        let first = f.coordinator.assign(task.id).await.unwrap();
        assert_eq!(first.worker_id, "a");

        // Make "a" busier so the fresh assignment prefers "b".
        f.workers.update_load("a", 3).await.unwrap();
        let second = f.coordinator.reassign(task.id).await.unwrap();
        assert_eq!(second.worker_id, "b");

        assert_eq!(f.workers.get("a").await.unwrap().current_load, 3);
        assert_eq!(f.workers.get("b").await.unwrap().current_load, 2);
        let stored = f.lifecycle.get(task.id).await.unwrap();
        assert_eq!(stored.assignments.len(), 2);
        assert_eq!(stored.assignments[0], first);
        assert_eq!(stored.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn reassign_without_workers_releases_to_pending() {
        let f = fixture(vec![Worker::new("a", "dev").with_skills(["rust"])]).await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("t").with_skills(["rust"]))
            .await
            .unwrap();
        f.coordinator.assign(task.id).await.unwrap();
        f.workers.set_active("a", false).await.unwrap();

        assert!(f.coordinator.reassign(task.id).await.unwrap_err().is_unassignable());
        let stored = f.lifecycle.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.assigned_worker_id.is_none());
        assert_eq!(f.workers.get("a").await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn move_requires_strict_improvement() {
        let f = fixture(vec![
            Worker::new("a", "dev").with_skills(["rust"]),
            Worker::new("b", "dev").with_skills(["rust"]),
        ])
        .await;
        let task = f
            .lifecycle
            .submit(TaskDraft::new("t").with_skills(["rust"]))
            .await
            .unwrap();
        f.coordinator.assign(task.id).await.unwrap();

        // Equal footing: no move.
        assert!(f.coordinator.move_task(task.id, "a", "b", None).await.unwrap().is_none());

        f.workers.update_load("a", 2).await.unwrap();
        let moved = f.coordinator.move_task(task.id, "a", "b", None).await.unwrap();
        assert_eq!(moved.unwrap().worker_id, "b");
        assert_eq!(f.workers.get("a").await.unwrap().current_load, 2);
        assert_eq!(f.workers.get("b").await.unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn step_selection_avoids_listed_workers() {
        let f = fixture(vec![
            Worker::new("a", "dev").with_skills(["rust"]),
            Worker::new("b", "dev").with_skills(["rust", "review"]),
        ])
        .await;
        let task = f.lifecycle.submit(TaskDraft::new("t")).await.unwrap();
        let skills: BTreeSet<String> = ["rust".to_string()].into();

        let pick = f.coordinator.select_for_step(&task, &skills, 1, &[]).await.unwrap();
        assert_eq!(pick.worker_id, "a");
        let pick = f
            .coordinator
            .select_for_step(&task, &skills, 1, &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(pick.worker_id, "b");
        // Only "a" exists for this skill set once "b" is gone: fall back.
        f.workers.set_active("b", false).await.unwrap();
        let pick = f
            .coordinator
            .select_for_step(&task, &skills, 1, &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(pick.worker_id, "a");
    }
}
