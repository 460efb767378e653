//! Orchestrator: the public surface of the crate.
//!
//! Wires the worker directory, lifecycle manager, assignment coordinator,
//! workflow planner/executor, event broadcaster and rebalancer together and
//! exposes the task, worker and maintenance operations callers use.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assignment::AssignmentCoordinator;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::events::{EventBroadcaster, EventObserver, SubscriberId, SubscriptionHandle, TaskEvent};
use crate::rebalancer::{self, RebalanceReport, Rebalancer};
use crate::scoring::{ScoringEngine, SkillMatchScorer};
use crate::store::{InMemoryStore, TaskFilter, TaskRepository, WorkerRepository};
use crate::tasks::model::{Task, TaskDraft, TaskStatus};
use crate::tasks::TaskLifecycleManager;
use crate::workers::{Worker, WorkerDirectory, WorkerWorkload};
use crate::workflow::{StepRunner, WorkflowExecutor, WorkflowPlan, WorkflowPlanner, WorkflowReport, WorkflowStatus};

/// Result of an optimize pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OptimizeReport {
    /// Tasks placed or moved.
    pub optimized_count: usize,
    /// Tasks examined.
    pub total_count: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    workers: Arc<WorkerDirectory>,
    events: Arc<EventBroadcaster>,
    lifecycle: Arc<TaskLifecycleManager>,
    coordinator: Arc<AssignmentCoordinator>,
    planner: WorkflowPlanner,
    executor: WorkflowExecutor,
    rebalancer: Arc<Rebalancer>,
    /// Cancellation flags of workflows currently executing.
    running: RwLock<HashMap<Uuid, watch::Sender<bool>>>,
}

impl Orchestrator {
    /// Build an orchestrator scoring with [`SkillMatchScorer`].
    pub fn new(
        config: OrchestratorConfig,
        tasks: Arc<dyn TaskRepository>,
        workers: Arc<dyn WorkerRepository>,
    ) -> Result<Self> {
        let scorer = Arc::new(SkillMatchScorer::from_config(&config));
        Self::with_scorer(config, tasks, workers, scorer)
    }

    /// Build an orchestrator backed by a fresh [`InMemoryStore`].
    pub fn in_memory(config: OrchestratorConfig) -> Result<Self> {
        let store = Arc::new(InMemoryStore::new());
        Self::new(config, store.clone(), store)
    }

    pub fn with_scorer(
        config: OrchestratorConfig,
        tasks: Arc<dyn TaskRepository>,
        workers: Arc<dyn WorkerRepository>,
        scorer: Arc<dyn ScoringEngine>,
    ) -> Result<Self> {
        config.validate()?;

        let directory = Arc::new(
            WorkerDirectory::new(workers).with_default_capacity(config.default_worker_capacity),
        );
        let events = EventBroadcaster::new(config.event_backlog);
        let lifecycle = Arc::new(TaskLifecycleManager::new(
            tasks,
            directory.clone(),
            events.clone(),
            config.max_transition_history,
        ));
        let coordinator = Arc::new(AssignmentCoordinator::new(
            lifecycle.clone(),
            directory.clone(),
            scorer,
            config.require_skill_match,
        ));
        let planner = WorkflowPlanner::new(coordinator.clone(), config.collaboration_threshold);
        let executor = WorkflowExecutor::new(
            lifecycle.clone(),
            config.max_parallel_steps,
            config.step_max_retries,
            config.step_timeout,
        );
        let rebalancer = Arc::new(Rebalancer::new(
            coordinator.clone(),
            lifecycle.clone(),
            directory.clone(),
            config.high_water_load,
            config.stale_after,
        ));

        Ok(Self {
            config,
            workers: directory,
            events,
            lifecycle,
            coordinator,
            planner,
            executor,
            rebalancer,
            running: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Record a task, plan a collaboration if one worker is not a good
    /// enough fit, and assign it.
    ///
    /// A task nobody can take is left pending for the rebalancer rather than
    /// failed.
    pub async fn submit_task(&self, draft: TaskDraft) -> Result<Task> {
        let task = self.lifecycle.submit(draft).await?;
        let best = self.coordinator.best_score(&task).await?;

        if self.planner.needs_collaboration(&task, best) {
            match self.planner.plan_collaboration(&task).await {
                Ok(Some(plan)) => self.attach_plan(task.id, plan).await?,
                Ok(None) => debug!(task_id = %task.id, "No collaboration plan, assigning directly"),
                Err(e) => warn!(task_id = %task.id, error = %e, "Collaboration planning failed"),
            }
        }

        self.try_assign(task.id).await?;
        self.lifecycle.get(task.id).await
    }

    /// Move a failed task back to pending and try to assign it again.
    pub async fn retry_task(&self, id: Uuid) -> Result<Task> {
        self.lifecycle.retry(id).await?;
        self.try_assign(id).await?;
        self.lifecycle.get(id).await
    }

    /// Remove a task. Fails with `Conflict` while it is running.
    pub async fn delete_task(&self, id: Uuid) -> Result<()> {
        self.lifecycle.delete(id).await
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.lifecycle.get(id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.lifecycle.list(filter).await
    }

    /// Reassign an assigned task to the best worker available now.
    pub async fn reassign_task(&self, id: Uuid) -> Result<Task> {
        self.coordinator.reassign(id).await?;
        self.lifecycle.get(id).await
    }

    pub async fn start_task(&self, id: Uuid) -> Result<Task> {
        self.lifecycle.start(id).await
    }

    pub async fn complete_task(&self, id: Uuid, output: impl Into<String>, actual_effort: Option<u32>) -> Result<Task> {
        self.lifecycle.complete(id, output.into(), actual_effort).await
    }

    pub async fn fail_task(&self, id: Uuid, message: impl Into<String>) -> Result<Task> {
        self.lifecycle.fail(id, message).await
    }

    /// Fail an assigned or running task and stop its workflow, if one is
    /// executing.
    pub async fn cancel_task(&self, id: Uuid) -> Result<Task> {
        let task = {
            let _guard = self.lifecycle.lock(id).await;
            let mut task = self.lifecycle.get(id).await?;
            self.lifecycle.fail_locked(&mut task, "cancelled".into()).await?;
            task
        };
        self.lifecycle.retire_lock(id).await;

        if let Some(flag) = self.running.read().await.get(&id) {
            // The executor may already be gone.
            let _ = flag.send(true);
        }
        info!(task_id = %id, "Task cancelled");
        Ok(task)
    }

    /// Run an assigned task's workflow with `runner` doing each step, then
    /// complete or fail the task from the outcome.
    ///
    /// Tasks without a collaboration plan run as a single step by their
    /// assigned worker. Only one call can start a given task; any other gets
    /// `Conflict` and leaves the task alone.
    pub async fn run_workflow(&self, id: Uuid, runner: Arc<dyn StepRunner>) -> Result<WorkflowReport> {
        // assigned → running is checked and applied under the task lock.
        let task = self.lifecycle.start(id).await?;
        let worker_id = task.assigned_worker_id.clone().unwrap_or_default();
        let plan = task
            .workflow
            .clone()
            .unwrap_or_else(|| WorkflowPlan::single(&task, &worker_id));

        let (flag, cancel) = watch::channel(false);
        {
            let mut running = self.running.write().await;
            // A cancel may have landed between the start and this point.
            if self.lifecycle.get(id).await?.status != TaskStatus::Running {
                let _ = flag.send(true);
            }
            running.insert(id, flag);
        }

        let outcome = self.executor.execute(&plan, runner, cancel).await;
        self.running.write().await.remove(&id);

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                if let Err(fail) = self.lifecycle.fail(id, e.to_string()).await {
                    debug!(task_id = %id, error = %fail, "Task not failed after workflow error");
                }
                return Err(e);
            }
        };

        let settled = match report.status {
            WorkflowStatus::Completed => self.lifecycle.complete(id, report.output(), None).await,
            WorkflowStatus::Failed => {
                let message = report.failure.clone().unwrap_or_else(|| "workflow failed".into());
                self.lifecycle.fail(id, message).await
            }
            // `cancel_task` already failed the task.
            WorkflowStatus::Cancelled => return Ok(report),
        };
        match settled {
            Ok(_) => {}
            // Cancelled while the last step was settling.
            Err(e) if e.is_conflict() => debug!(task_id = %id, error = %e, "Task already left running"),
            Err(e) => return Err(e),
        }
        Ok(report)
    }

    // ── Workers ─────────────────────────────────────────────────────

    /// Add or replace a worker. A worker without a capacity gets
    /// `default_worker_capacity`.
    pub async fn register_worker(&self, worker: Worker) -> Result<Worker> {
        self.workers.register(worker).await
    }

    /// Mark a worker available or away. Its current tasks stay where they
    /// are until the next optimize pass.
    pub async fn set_worker_active(&self, id: &str, active: bool) -> Result<Worker> {
        self.workers.set_active(id, active).await
    }

    pub async fn get_worker(&self, id: &str) -> Result<Worker> {
        self.workers.get(id).await
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        self.workers.list().await
    }

    /// Task counts for one worker, by status.
    pub async fn get_worker_workload(&self, id: &str) -> Result<WorkerWorkload> {
        self.workers.get(id).await?;
        let tasks = self.lifecycle.list(&TaskFilter::for_worker(id)).await?;

        let mut workload = WorkerWorkload {
            total: tasks.len(),
            ..Default::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Assigned | TaskStatus::Running => workload.active += 1,
                TaskStatus::Completed => workload.completed += 1,
                TaskStatus::Failed => workload.failed += 1,
                TaskStatus::Created | TaskStatus::Pending => {}
            }
        }
        Ok(workload)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Place every pending task that can be placed, and move every assigned
    /// task to a worker that scores strictly better than its current one.
    pub async fn optimize_assignments(&self) -> Result<OptimizeReport> {
        let mut report = OptimizeReport::default();
        let pending = self.lifecycle.list(&TaskFilter::with_status(TaskStatus::Pending)).await?;
        let assigned = self.lifecycle.list(&TaskFilter::with_status(TaskStatus::Assigned)).await?;

        for task in pending {
            report.total_count += 1;
            if self.try_assign(task.id).await? {
                report.optimized_count += 1;
            }
        }

        for task in assigned {
            report.total_count += 1;
            match self.improve(&task).await {
                Ok(true) => report.optimized_count += 1,
                Ok(false) => {}
                Err(e) if e.is_not_found() || e.is_conflict() || e.is_unassignable() => {
                    debug!(task_id = %task.id, error = %e, "Task skipped by optimize pass");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            optimized = report.optimized_count,
            total = report.total_count,
            "Assignments optimized"
        );
        Ok(report)
    }

    pub async fn rebalance_workload(&self) -> Result<RebalanceReport> {
        self.rebalancer.run_once().await
    }

    /// Start sweeping every `rebalance_interval` in the background.
    pub fn spawn_rebalance_loop(&self) -> JoinHandle<()> {
        rebalancer::spawn_rebalance_loop(self.rebalancer.clone(), self.config.rebalance_interval)
    }

    // ── Events ──────────────────────────────────────────────────────

    pub async fn subscribe(&self, observer: Arc<dyn EventObserver>) -> SubscriptionHandle {
        self.events.subscribe(observer).await
    }

    pub async fn subscribe_stream(&self) -> (SubscriberId, ReceiverStream<TaskEvent>) {
        self.events.subscribe_stream().await
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.events.unsubscribe(id).await
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn attach_plan(&self, id: Uuid, plan: WorkflowPlan) -> Result<()> {
        let _guard = self.lifecycle.lock(id).await;
        let mut task = self.lifecycle.get(id).await?;
        debug!(task_id = %id, steps = plan.steps.len(), "Workflow plan attached");
        task.workflow = Some(plan);
        self.lifecycle.persist(&task).await
    }

    /// Assign a pending task. `Ok(false)` if nobody can take it now.
    async fn try_assign(&self, id: Uuid) -> Result<bool> {
        match self.coordinator.assign(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_unassignable() => {
                info!(task_id = %id, reason = %e, "Task left pending");
                Ok(false)
            }
            // Someone else assigned or removed it in the meantime.
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move an assigned task if a strictly better worker exists. A task
    /// whose worker is gone or away is reassigned outright.
    async fn improve(&self, task: &Task) -> Result<bool> {
        let Some(current_id) = task.assigned_worker_id.as_deref() else {
            return Ok(false);
        };
        let current = match self.workers.get(current_id).await {
            Ok(worker) if worker.active => worker,
            Ok(_) => return self.coordinator.reassign(task.id).await.map(|_| true),
            Err(e) if e.is_not_found() => return self.coordinator.reassign(task.id).await.map(|_| true),
            Err(e) => return Err(e),
        };

        let baseline = self.coordinator.score_without_self(&current, task);
        let Some(better) = self
            .coordinator
            .rank(task)
            .await?
            .into_iter()
            .find(|c| c.worker.id != current.id && c.score > baseline)
        else {
            return Ok(false);
        };

        Ok(self
            .coordinator
            .move_task(task.id, &current.id, &better.worker.id, None)
            .await?
            .is_some())
    }
}
