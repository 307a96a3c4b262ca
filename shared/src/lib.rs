//! Shared data structures and utilities for the desipipe task scheduler
//!
//! This crate contains the task state machine, identity hashing, the argument
//! codec and the TaskManager configuration model used by both the library API
//! and the scheduler/worker processes.

pub mod codec;
pub mod config;
pub mod defaults;
pub mod hashing;
pub mod state;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::{EnvironmentSpec, ProviderSpec, SchedulerSpec, TaskManagerConfig};
pub use hashing::{app_hash, task_id};
pub use state::TaskState;

/// Result type alias used throughout the workspace
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the task scheduler
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("Queue corruption: {0}")]
    QueueCorruption(String),

    #[error("Dependency {id} failed")]
    DependencyFailed { id: String },

    #[error("Task {id} ended in state {state} (errno {errno}): {message}")]
    TaskFailed {
        id: String,
        state: TaskState,
        errno: i64,
        message: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests;
