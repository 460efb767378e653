//! Tasks: data model and the lifecycle state machine.

pub mod lifecycle;
pub mod model;

pub use lifecycle::TaskLifecycleManager;
pub use model::{Assignment, StatusTransition, Task, TaskDraft, TaskPriority, TaskStatus};
