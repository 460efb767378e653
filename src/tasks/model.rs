//! Task data model: priorities, the status state machine, assignments.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::model::{WorkflowPlan, WorkflowStepResult};

/// Urgency of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Recorded but not yet submitted for assignment.
    Created,
    /// Waiting for a worker.
    Pending,
    /// Bound to a worker, not started.
    Assigned,
    /// Being worked on.
    Running,
    /// Output delivered.
    Completed,
    /// An error surfaced; only an explicit retry leaves this state.
    Failed,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Created, Pending) |
            (Pending, Assigned) |
            // Released by a reassignment that found no eligible worker
            (Assigned, Pending) |
            (Assigned, Running) |
            // Cancelled before it started
            (Assigned, Failed) |
            (Running, Completed) | (Running, Failed) |
            // Explicit retry
            (Failed, Pending)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a task in this state holds a worker.
    pub fn holds_worker(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A recorded status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Record binding a task to a worker at a point in time. Never edited;
/// a reassignment appends a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: Uuid,
    pub worker_id: String,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
    pub rationale: String,
}

/// Caller-supplied fields for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub required_skills: BTreeSet<String>,
    #[serde(default = "default_effort")]
    pub estimated_effort: u32,
    /// Force collaboration planning regardless of score.
    #[serde(default)]
    pub complex: bool,
}

fn default_effort() -> u32 {
    1
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            estimated_effort: default_effort(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_effort(mut self, effort: u32) -> Self {
        self.estimated_effort = effort;
        self
    }

    pub fn complex(mut self) -> Self {
        self.complex = true;
        self
    }
}

/// A unit of requested work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When `status` last changed.
    pub status_changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker_id: Option<String>,
    /// Worker whose load currently includes this task's effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_charged_to: Option<String>,
    pub required_skills: BTreeSet<String>,
    pub estimated_effort: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_effort: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub complex: bool,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub transitions: Vec<StatusTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowPlan>,
    #[serde(default)]
    pub step_results: Vec<WorkflowStepResult>,
}

impl Task {
    /// Create a task in `created` from a draft.
    pub fn from_draft(draft: TaskDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: draft.title,
            description: draft.description,
            priority: draft.priority,
            status: TaskStatus::Created,
            created_at: now,
            started_at: None,
            completed_at: None,
            status_changed_at: now,
            assigned_worker_id: None,
            load_charged_to: None,
            required_skills: draft.required_skills,
            estimated_effort: draft.estimated_effort,
            actual_effort: None,
            output: None,
            error_message: None,
            complex: draft.complex,
            assignments: Vec::new(),
            transitions: Vec::new(),
            workflow: None,
            step_results: Vec::new(),
        }
    }

    /// Transition to a new status, keeping at most `max_history` records.
    pub fn transition_to(
        &mut self,
        new_status: TaskStatus,
        reason: Option<String>,
        max_history: usize,
    ) -> Result<StatusTransition, String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            ));
        }

        let now = Utc::now();
        let transition = StatusTransition {
            from: self.status,
            to: new_status,
            at: now,
            reason,
        };
        self.transitions.push(transition.clone());
        if self.transitions.len() > max_history {
            let drain_count = self.transitions.len() - max_history;
            self.transitions.drain(..drain_count);
        }

        self.status = new_status;
        self.status_changed_at = now;

        match new_status {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                self.completed_at = Some(now);
            }
            _ => {}
        }

        Ok(transition)
    }

    /// The assignment currently binding this task, if any.
    pub fn active_assignment(&self) -> Option<&Assignment> {
        if !self.status.holds_worker() {
            return None;
        }
        let worker = self.assigned_worker_id.as_deref()?;
        self.assignments
            .last()
            .filter(|a| a.worker_id == worker)
    }
}
