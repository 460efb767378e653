//! Worker directory: capability profiles and current load.

pub mod directory;
pub mod model;

pub use directory::WorkerDirectory;
pub use model::{Worker, WorkerWorkload};
