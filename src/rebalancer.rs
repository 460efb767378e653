//! Rebalancer: shifts work off overloaded workers and places stale
//! pending tasks.
//!
//! A sweep has two phases. First, tasks assigned (not yet running) to a
//! worker above the high-water load are offered to the least-loaded eligible
//! worker that would score strictly better and stay at or under the mark.
//! Then pending tasks that have waited longer than the staleness threshold
//! are assigned to anyone who can take them without crossing the mark.
//!
//! Every move lowers the total load above the mark and never raises it, so
//! a sweep settles, and a second sweep over unchanged state does nothing.
//! Only one sweep runs at a time; an overlapping call returns immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::assignment::AssignmentCoordinator;
use crate::error::Result;
use crate::store::TaskFilter;
use crate::tasks::model::{Task, TaskStatus};
use crate::tasks::TaskLifecycleManager;
use crate::workers::{Worker, WorkerDirectory};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub rebalanced: bool,
    pub actions_taken: usize,
}

impl RebalanceReport {
    fn from_actions(actions_taken: usize) -> Self {
        Self {
            rebalanced: actions_taken > 0,
            actions_taken,
        }
    }
}

pub struct Rebalancer {
    coordinator: Arc<AssignmentCoordinator>,
    lifecycle: Arc<TaskLifecycleManager>,
    workers: Arc<WorkerDirectory>,
    high_water: u32,
    stale_after: Duration,
    in_flight: Mutex<()>,
}

impl Rebalancer {
    pub fn new(
        coordinator: Arc<AssignmentCoordinator>,
        lifecycle: Arc<TaskLifecycleManager>,
        workers: Arc<WorkerDirectory>,
        high_water: u32,
        stale_after: Duration,
    ) -> Self {
        Self {
            coordinator,
            lifecycle,
            workers,
            high_water,
            stale_after,
            in_flight: Mutex::new(()),
        }
    }

    /// Run one sweep. Returns zero actions if another sweep is in progress.
    pub async fn run_once(&self) -> Result<RebalanceReport> {
        let Ok(_sweep) = self.in_flight.try_lock() else {
            debug!("Rebalance already in progress, skipping");
            return Ok(RebalanceReport::default());
        };

        let mut actions = 0;
        // Each pass can free room that an earlier task in the same pass
        // could not use, so repeat until nothing moves.
        loop {
            let moved = self.relieve_overloaded().await?;
            if moved == 0 {
                break;
            }
            actions += moved;
        }
        actions += self.place_stale().await?;

        if actions > 0 {
            info!(actions_taken = actions, "Workload rebalanced");
        }
        Ok(RebalanceReport::from_actions(actions))
    }

    async fn relieve_overloaded(&self) -> Result<usize> {
        let overloaded: Vec<Worker> = self
            .workers
            .list()
            .await?
            .into_iter()
            .filter(|w| w.current_load > self.high_water)
            .collect();

        let mut moved = 0;
        for source in overloaded {
            let mut tasks = self
                .lifecycle
                .list(&TaskFilter::with_status(TaskStatus::Assigned).assigned_to(&source.id))
                .await?;
            tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

            for task in tasks {
                // Re-read: earlier moves in this pass changed the source.
                let current = self.workers.get(&source.id).await?;
                if current.current_load <= self.high_water {
                    break;
                }
                let Some(target) = self.destination(&current, &task).await? else {
                    continue;
                };
                match self
                    .coordinator
                    .move_task(task.id, &source.id, &target, Some(self.high_water))
                    .await
                {
                    Ok(Some(_)) => moved += 1,
                    Ok(None) => {}
                    Err(e) => warn!(task_id = %task.id, error = %e, "Rebalance move failed"),
                }
            }
        }
        Ok(moved)
    }

    /// Least-loaded eligible worker that beats the task's current score and
    /// has room under the high-water mark.
    async fn destination(&self, source: &Worker, task: &Task) -> Result<Option<String>> {
        let current = self.coordinator.score_without_self(source, task);
        let target = self
            .coordinator
            .rank(task)
            .await?
            .into_iter()
            .filter(|c| c.worker.id != source.id)
            .filter(|c| c.score > current)
            .filter(|c| c.worker.current_load.saturating_add(task.estimated_effort) <= self.high_water)
            .min_by(|a, b| {
                a.worker
                    .current_load
                    .cmp(&b.worker.current_load)
                    .then(b.score.total_cmp(&a.score))
                    .then_with(|| a.worker.id.cmp(&b.worker.id))
            })
            .map(|c| c.worker.id);
        Ok(target)
    }

    async fn place_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let mut pending = self
            .lifecycle
            .list(&TaskFilter::with_status(TaskStatus::Pending))
            .await?;
        pending.retain(|t| (now - t.status_changed_at).to_std().unwrap_or_default() >= self.stale_after);
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut placed = 0;
        for task in pending {
            match self.coordinator.assign_within(task.id, self.high_water).await {
                Ok(Some(_)) => placed += 1,
                Ok(None) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to place stale task"),
            }
        }
        Ok(placed)
    }
}

/// Spawn the background rebalance loop.
///
/// The first sweep runs one `interval` after startup.
pub fn spawn_rebalance_loop(rebalancer: Arc<Rebalancer>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Rebalance loop started (interval: {}s)", interval.as_secs());

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = rebalancer.run_once().await {
                warn!(error = %e, "Rebalance sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBroadcaster;
    use crate::scoring::SkillMatchScorer;
    use crate::store::InMemoryStore;
    use crate::tasks::model::TaskDraft;

    struct Fixture {
        lifecycle: Arc<TaskLifecycleManager>,
        workers: Arc<WorkerDirectory>,
        coordinator: Arc<AssignmentCoordinator>,
        rebalancer: Rebalancer,
    }

    async fn fixture(workers: Vec<Worker>, high_water: u32) -> Fixture {
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
        let rebalancer = Rebalancer::new(
            coordinator.clone(),
            lifecycle.clone(),
            directory.clone(),
            high_water,
            Duration::ZERO,
        );
        Fixture {
            lifecycle,
            workers: directory,
            coordinator,
            rebalancer,
        }
    }

    /// Pile three tasks onto w1 while w2 is away, then bring w2 back.
    async fn overloaded() -> Fixture {
        let f = fixture(
            vec![
                Worker::new("w1", "dev").with_skills(["rust"]),
                Worker::new("w2", "dev").with_skills(["rust"]).inactive(),
            ],
            2,
        )
        .await;
        for n in 0..3 {
            let task = f
                .lifecycle
                .submit(TaskDraft::new(format!("t{n}")).with_skills(["rust"]))
                .await
                .unwrap();
            f.coordinator.assign(task.id).await.unwrap();
        }
        f.workers.set_active("w2", true).await.unwrap();
        f
    }

    #[tokio::test]
    async fn moves_work_off_overloaded_worker() {
        let f = overloaded().await;
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 3);

        let report = f.rebalancer.run_once().await.unwrap();
        assert_eq!(report, RebalanceReport { rebalanced: true, actions_taken: 1 });
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 2);
        assert_eq!(f.workers.get("w2").await.unwrap().current_load, 1);

        // The oldest task moved.
        let moved = f
            .lifecycle
            .list(&TaskFilter::for_worker("w2"))
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].title, "t0");
        assert_eq!(moved[0].assignments.len(), 2);
    }

    #[tokio::test]
    async fn second_sweep_is_a_no_op() {
        let f = overloaded().await;
        f.rebalancer.run_once().await.unwrap();
        let again = f.rebalancer.run_once().await.unwrap();
        assert_eq!(again, RebalanceReport::default());
    }

    #[tokio::test]
    async fn never_pushes_destination_over_high_water() {
        let f = overloaded().await;
        // w2 already sits at the mark.
        f.workers.update_load("w2", 2).await.unwrap();
        let report = f.rebalancer.run_once().await.unwrap();
        assert_eq!(report.actions_taken, 0);
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 3);
    }

    #[tokio::test]
    async fn places_stale_pending_tasks() {
        let f = fixture(vec![Worker::new("w1", "dev").with_skills(["rust"]).inactive()], 2).await;
        let mut ids = Vec::new();
        for n in 0..3 {
            let task = f
                .lifecycle
                .submit(TaskDraft::new(format!("t{n}")).with_skills(["rust"]))
                .await
                .unwrap();
            ids.push(task.id);
        }
        f.workers.set_active("w1", true).await.unwrap();

        let report = f.rebalancer.run_once().await.unwrap();
        assert_eq!(report.actions_taken, 2);
        assert_eq!(f.workers.get("w1").await.unwrap().current_load, 2);
        // Oldest first; the last one waits for room.
        assert_eq!(f.lifecycle.get(ids[2]).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(f.lifecycle.get(ids[0]).await.unwrap().status, TaskStatus::Assigned);

        assert_eq!(f.rebalancer.run_once().await.unwrap().actions_taken, 0);
    }

    #[tokio::test]
    async fn fresh_pending_tasks_are_left_alone() {
        let mut f = fixture(vec![Worker::new("w1", "dev").with_skills(["rust"]).inactive()], 4).await;
        f.rebalancer.stale_after = Duration::from_secs(3600);
        f.lifecycle
            .submit(TaskDraft::new("t").with_skills(["rust"]))
            .await
            .unwrap();
        f.workers.set_active("w1", true).await.unwrap();
        assert_eq!(f.rebalancer.run_once().await.unwrap().actions_taken, 0);
    }

    #[tokio::test]
    async fn overlapping_sweep_is_skipped() {
        let f = overloaded().await;
        let busy = f.rebalancer.in_flight.lock().await;
        assert_eq!(f.rebalancer.run_once().await.unwrap().actions_taken, 0);
        drop(busy);
        assert_eq!(f.rebalancer.run_once().await.unwrap().actions_taken, 1);
    }

    #[tokio::test]
    async fn running_tasks_stay_put() {
        let f = overloaded().await;
        for task in f.lifecycle.list(&TaskFilter::all()).await.unwrap() {
            f.lifecycle.start(task.id).await.unwrap();
        }
        assert_eq!(f.rebalancer.run_once().await.unwrap().actions_taken, 0);
    }
}
