//! desipipe: a persistent, DAG-aware task scheduler for batch pipelines
//!
//! Users declare apps and submit tasks whose arguments may reference the
//! future results of other tasks. Task rows are persisted in a per-queue
//! SQLite store, a background spawn loop provisions workers through local or
//! Slurm providers, and any process can await a task's result through its
//! [`task::TaskFuture`] handle.
//!
//! The library surface is the queue/manager API; the `desipipe` binary wraps
//! it with the pipeline management CLI (`spawn`, `pause`, `retry`, ...).

pub mod database;
pub mod manager;
pub mod provider;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod worker;

// Re-export the user-facing entry points
pub use manager::{App, AppRegistry, ReusePolicy, TaskInput, TaskManager};
pub use queue::Queue;
pub use shared::{PipelineError, TaskManagerConfig, TaskState};
pub use task::{Task, TaskFuture};
pub use worker::Worker;

#[cfg(test)]
mod tests;
