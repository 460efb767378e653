//! Crew Orchestrator: assigns tasks to a roster of workers by skill fit and
//! load, runs multi-worker workflows, and streams every state change to
//! subscribers.

pub mod assignment;
pub mod config;
pub mod error;
pub mod events;
pub mod locks;
pub mod orchestrator;
pub mod rebalancer;
pub mod scoring;
pub mod store;
pub mod tasks;
pub mod workers;
pub mod workflow;

pub use config::OrchestratorConfig;
pub use error::{Error, OrchestratorError, Result};
pub use orchestrator::{OptimizeReport, Orchestrator};
pub use rebalancer::RebalanceReport;
