//! Workflow executor: runs a plan's steps as their dependencies complete.
//!
//! Ready steps run concurrently on a `JoinSet`, at most `max_parallel` at a
//! time. A failed retryable step goes back to pending until its retries are
//! spent; any other failure stops the workflow and aborts what is still in
//! flight. Cancellation aborts in-flight steps and fails every step that has
//! not finished with the error `"cancelled"`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::tasks::TaskLifecycleManager;
use crate::workflow::model::{StepStatus, WorkflowPlan, WorkflowStep, WorkflowStepResult};

/// A failed unit of work.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct StepError(pub String);

impl From<&str> for StepError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StepError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Output of a completed dependency, handed to the steps after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub step_index: usize,
    pub worker_id: String,
    pub output: String,
}

/// Everything a runner needs to perform one step attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: Uuid,
    pub step: WorkflowStep,
    /// 1-based attempt number.
    pub attempt: u32,
    pub inputs: Vec<StepInput>,
}

/// Performs the work of a step on behalf of its worker.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, ctx: StepContext) -> std::result::Result<String, StepError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub task_id: Uuid,
    pub status: WorkflowStatus,
    pub results: Vec<WorkflowStepResult>,
    /// Why the workflow failed, if it did.
    pub failure: Option<String>,
    terminal_steps: Vec<usize>,
}

impl WorkflowReport {
    /// Combined output of the terminal steps.
    pub fn output(&self) -> String {
        self.terminal_steps
            .iter()
            .filter_map(|i| self.results.get(*i))
            .filter_map(|r| r.output.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

enum Fault {
    Failed(String),
    TimedOut,
}

pub struct WorkflowExecutor {
    lifecycle: Arc<TaskLifecycleManager>,
    max_parallel: usize,
    max_retries: u32,
    step_timeout: Duration,
}

impl WorkflowExecutor {
    pub fn new(
        lifecycle: Arc<TaskLifecycleManager>,
        max_parallel: usize,
        max_retries: u32,
        step_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            max_parallel: max_parallel.max(1),
            max_retries,
            step_timeout,
        }
    }

    /// Run `plan` to completion, failure or cancellation.
    pub async fn execute(
        &self,
        plan: &WorkflowPlan,
        runner: Arc<dyn StepRunner>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<WorkflowReport> {
        let task_id = plan.task_id;
        plan.validate()
            .map_err(|reason| OrchestratorError::InvalidPlan { task_id, reason })?;

        let mut results: Vec<WorkflowStepResult> = plan
            .steps
            .iter()
            .map(|s| WorkflowStepResult::pending(s.index))
            .collect();
        let mut in_flight: JoinSet<(usize, std::result::Result<String, Fault>)> = JoinSet::new();
        let mut failure: Option<OrchestratorError> = None;
        let mut cancelled = *cancel.borrow();
        let mut watching = true;

        info!(task_id = %task_id, steps = plan.steps.len(), "Workflow started");

        loop {
            if failure.is_none() && !cancelled {
                for step in &plan.steps {
                    if in_flight.len() >= self.max_parallel {
                        break;
                    }
                    let ready = results[step.index].status == StepStatus::Pending
                        && step
                            .dependencies
                            .iter()
                            .all(|d| results[*d].status == StepStatus::Completed);
                    if ready {
                        self.launch(plan, step, &mut results, &mut in_flight, runner.clone())
                            .await;
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok((index, outcome))) => {
                            let step = &plan.steps[index];
                            if let Some(err) = self.settle(task_id, step, &mut results, outcome).await {
                                if failure.is_none() {
                                    warn!(task_id = %task_id, step = index, error = %err, "Workflow step failed");
                                    failure = Some(err);
                                    in_flight.abort_all();
                                }
                            }
                        }
                        // Aborted by cancellation or failure; settled below.
                        Some(Err(_)) | None => {}
                    }
                }
                changed = cancel.changed(), if watching && !cancelled => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            info!(task_id = %task_id, "Workflow cancelled");
                            cancelled = true;
                            in_flight.abort_all();
                        }
                        Ok(()) => {}
                        Err(_) => watching = false,
                    }
                }
            }
        }

        // Steps still marked active were aborted. A cancelled workflow also
        // resolves the steps it never started.
        for step in &plan.steps {
            let status = results[step.index].status;
            let unresolved =
                status == StepStatus::Active || (cancelled && status == StepStatus::Pending);
            if unresolved {
                let result = &mut results[step.index];
                result.status = StepStatus::Failed;
                result.error = Some(if cancelled { "cancelled" } else { "aborted" }.into());
                result.completed_at = Some(Utc::now());
                self.record(task_id, result, &step.worker_id).await;
            }
        }

        let all_completed = results.iter().all(|r| r.status == StepStatus::Completed);
        let (status, failure) = if cancelled {
            (WorkflowStatus::Cancelled, Some("cancelled".to_string()))
        } else if let Some(err) = failure {
            (WorkflowStatus::Failed, Some(err.to_string()))
        } else if all_completed {
            (WorkflowStatus::Completed, None)
        } else {
            (
                WorkflowStatus::Failed,
                Some("workflow stalled with unresolved steps".to_string()),
            )
        };

        info!(task_id = %task_id, status = ?status, "Workflow finished");
        Ok(WorkflowReport {
            task_id,
            status,
            results,
            failure,
            terminal_steps: plan.terminal_steps(),
        })
    }

    async fn launch(
        &self,
        plan: &WorkflowPlan,
        step: &WorkflowStep,
        results: &mut [WorkflowStepResult],
        in_flight: &mut JoinSet<(usize, std::result::Result<String, Fault>)>,
        runner: Arc<dyn StepRunner>,
    ) {
        let task_id = plan.task_id;
        let inputs = step
            .dependencies
            .iter()
            .map(|d| StepInput {
                step_index: *d,
                worker_id: plan.steps[*d].worker_id.clone(),
                output: results[*d].output.clone().unwrap_or_default(),
            })
            .collect();

        let result = &mut results[step.index];
        result.status = StepStatus::Active;
        result.attempts += 1;
        result.error = None;
        result.started_at = Some(Utc::now());
        self.record(task_id, result, &step.worker_id).await;

        let ctx = StepContext {
            task_id,
            step: step.clone(),
            attempt: result.attempts,
            inputs,
        };
        let index = step.index;
        let timeout = self.step_timeout;
        debug!(task_id = %task_id, step = index, worker_id = %step.worker_id, attempt = ctx.attempt, "Step started");

        in_flight.spawn(async move {
            let run = AssertUnwindSafe(runner.run(ctx)).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, run).await {
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(e))) => Err(Fault::Failed(e.0)),
                Ok(Err(_panic)) => Err(Fault::Failed("step panicked".into())),
                Err(_) => Err(Fault::TimedOut),
            };
            (index, outcome)
        });
    }

    /// Apply a finished attempt. Returns the error that fails the workflow,
    /// if any.
    async fn settle(
        &self,
        task_id: Uuid,
        step: &WorkflowStep,
        results: &mut [WorkflowStepResult],
        outcome: std::result::Result<String, Fault>,
    ) -> Option<OrchestratorError> {
        let result = &mut results[step.index];
        let error = match outcome {
            Ok(output) => {
                result.status = StepStatus::Completed;
                result.output = Some(output);
                result.completed_at = Some(Utc::now());
                self.record(task_id, result, &step.worker_id).await;
                debug!(task_id = %task_id, step = step.index, "Step completed");
                return None;
            }
            Err(Fault::Failed(reason)) => OrchestratorError::StepExecution {
                task_id,
                step_index: step.index,
                reason,
            },
            Err(Fault::TimedOut) => OrchestratorError::Timeout {
                task_id,
                step_index: step.index,
                timeout: self.step_timeout,
            },
        };

        result.error = Some(error.to_string());
        if step.retryable && result.attempts <= self.max_retries {
            info!(task_id = %task_id, step = step.index, attempt = result.attempts, "Retrying step");
            result.status = StepStatus::Pending;
            self.record(task_id, result, &step.worker_id).await;
            return None;
        }

        result.status = StepStatus::Failed;
        result.completed_at = Some(Utc::now());
        self.record(task_id, result, &step.worker_id).await;
        Some(error)
    }

    async fn record(&self, task_id: Uuid, result: &WorkflowStepResult, worker_id: &str) {
        if let Err(e) = self.lifecycle.record_step(task_id, result, worker_id).await {
            warn!(task_id = %task_id, step = result.step_index, error = %e, "Failed to record step result");
        }
    }
}
