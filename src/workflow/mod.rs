//! Collaborative workflows: planning a task across several workers and
//! running the resulting steps.

pub mod executor;
pub mod model;
pub mod planner;

pub use executor::{
    StepContext, StepError, StepInput, StepRunner, WorkflowExecutor, WorkflowReport,
    WorkflowStatus,
};
pub use model::{StepMode, StepStatus, WorkflowPlan, WorkflowStep, WorkflowStepResult};
pub use planner::WorkflowPlanner;
