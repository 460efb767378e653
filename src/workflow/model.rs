//! Workflow plans and per-step results.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::model::{Assignment, Task};

/// How a step relates to the steps before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Consumes an earlier step's output.
    Sequential,
    /// Independent of its siblings in the same phase.
    Parallel,
    /// Checks other workers' output.
    Review,
}

/// Per-step state: pending → active → (completed | failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub index: usize,
    pub worker_id: String,
    pub objective: String,
    pub skills: BTreeSet<String>,
    /// Indices of steps that must complete first. Always lower than `index`.
    pub dependencies: Vec<usize>,
    /// Share of the task's estimated effort, in effort units.
    pub estimated_duration: u32,
    pub mode: StepMode,
    pub retryable: bool,
    pub assignment: Assignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub task_id: Uuid,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowPlan {
    /// A one-step plan run entirely by the task's assigned worker.
    pub fn single(task: &Task, worker_id: &str) -> Self {
        let assignment = task.active_assignment().cloned().unwrap_or_else(|| Assignment {
            task_id: task.id,
            worker_id: worker_id.to_string(),
            score: 0.0,
            timestamp: Utc::now(),
            rationale: "direct".into(),
        });
        Self {
            task_id: task.id,
            steps: vec![WorkflowStep {
                index: 0,
                worker_id: worker_id.to_string(),
                objective: task.title.clone(),
                skills: task.required_skills.clone(),
                dependencies: Vec::new(),
                estimated_duration: task.estimated_effort,
                mode: StepMode::Sequential,
                retryable: true,
                assignment,
            }],
        }
    }

    /// Check indices are positional and dependencies point backwards.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".into());
        }
        for (position, step) in self.steps.iter().enumerate() {
            if step.index != position {
                return Err(format!("step at position {position} has index {}", step.index));
            }
            if let Some(bad) = step.dependencies.iter().find(|d| **d >= step.index) {
                return Err(format!("step {} depends on later step {bad}", step.index));
            }
        }
        Ok(())
    }

    /// Steps nothing else depends on.
    pub fn terminal_steps(&self) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|s| !self.steps.iter().any(|o| o.dependencies.contains(&s.index)))
            .map(|s| s.index)
            .collect()
    }

    /// Distinct workers involved, in step order.
    pub fn workers(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for step in &self.steps {
            if !seen.contains(&step.worker_id.as_str()) {
                seen.push(step.worker_id.as_str());
            }
        }
        seen
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepResult {
    pub step_index: usize,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStepResult {
    pub fn pending(step_index: usize) -> Self {
        Self {
            step_index,
            status: StepStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::TaskDraft;

    fn step(index: usize, deps: &[usize]) -> WorkflowStep {
        WorkflowStep {
            index,
            worker_id: format!("w{index}"),
            objective: "do".into(),
            skills: BTreeSet::new(),
            dependencies: deps.to_vec(),
            estimated_duration: 1,
            mode: StepMode::Sequential,
            retryable: false,
            assignment: Assignment {
                task_id: Uuid::nil(),
                worker_id: format!("w{index}"),
                score: 1.0,
                timestamp: Utc::now(),
                rationale: String::new(),
            },
        }
    }

    #[test]
    fn validate_rejects_forward_dependency() {
        let plan = WorkflowPlan {
            task_id: Uuid::nil(),
            steps: vec![step(0, &[1]), step(1, &[])],
        };
        assert!(plan.validate().unwrap_err().contains("later step"));
    }

    #[test]
    fn validate_rejects_misnumbered() {
        let plan = WorkflowPlan {
            task_id: Uuid::nil(),
            steps: vec![step(1, &[])],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn terminal_steps_of_diamond() {
        let plan = WorkflowPlan {
            task_id: Uuid::nil(),
            steps: vec![step(0, &[]), step(1, &[0]), step(2, &[0]), step(3, &[1, 2])],
        };
        assert!(plan.validate().is_ok());
        assert_eq!(plan.terminal_steps(), vec![3]);
    }

    #[test]
    fn single_step_plan() {
        let task = Task::from_draft(TaskDraft::new("Fix typo").with_effort(2));
        let plan = WorkflowPlan::single(&task, "w1");
        assert!(plan.validate().is_ok());
        assert_eq!(plan.steps[0].estimated_duration, 2);
        assert_eq!(plan.workers(), vec!["w1"]);
    }
}
