//! Persistence seams: repository traits plus an in-memory backend.

pub mod memory;
pub mod traits;

pub use memory::InMemoryStore;
pub use traits::{TaskFilter, TaskRepository, WorkerRepository};
