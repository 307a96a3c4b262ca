//! Task state machine for the queue store
//!
//! Every task row carries one of the states below. All mutations of the queue
//! store go through the transition lattice encoded in
//! [`TaskState::can_transition`]; a transition outside the lattice is a
//! programming error and is rejected by the store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Distinguished errno values written by the scheduler rather than user code.
///
/// `0` is reserved for success. Positive values are user failures (bash exit
/// codes verbatim, derived values for in-process apps). Negative values can
/// never be produced by a subprocess exit status, which keeps
/// scheduler-assigned outcomes distinguishable from user ones.
pub mod errno {
    /// Task succeeded.
    pub const OK: i64 = 0;
    /// A transitive dependency ended in a terminal failure.
    pub const DEPENDENCY_FAILED: i64 = -2;
    /// Task was killed by an explicit `kill` request.
    pub const KILLED: i64 = -9;
}

/// State of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// At least one dependency is not yet SUCCEEDED.
    Waiting,
    /// All dependencies SUCCEEDED; eligible for claiming.
    Pending,
    /// Claimed by a worker; `jobid` is set and heartbeats are expected.
    Running,
    /// Finished with a result blob and errno 0.
    Succeeded,
    /// Finished with a non-zero errno; traceback recorded in `err`.
    Failed,
    /// Terminated by an explicit kill or a provider walltime expiry.
    Killed,
    /// Was RUNNING but the heartbeat expired; requires an explicit retry.
    Unknown,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "WAITING",
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Killed => "KILLED",
            TaskState::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "WAITING" => Ok(TaskState::Waiting),
            "PENDING" => Ok(TaskState::Pending),
            "RUNNING" => Ok(TaskState::Running),
            "SUCCEEDED" => Ok(TaskState::Succeeded),
            "FAILED" => Ok(TaskState::Failed),
            "KILLED" => Ok(TaskState::Killed),
            "UNKNOWN" => Ok(TaskState::Unknown),
            _ => Err(anyhow::anyhow!("Invalid task state: {}", s)),
        }
    }

    /// All states, in display order.
    pub const ALL: [TaskState; 7] = [
        TaskState::Waiting,
        TaskState::Pending,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Killed,
        TaskState::Unknown,
    ];

    /// Terminal states are never left except through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Killed
        )
    }

    /// Terminal failure states that propagate to dependents.
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Killed)
    }

    /// Whether the transition `self -> to` is allowed by the state lattice.
    ///
    /// ```text
    /// WAITING -> PENDING -> RUNNING -> {SUCCEEDED, FAILED, KILLED}
    /// WAITING | PENDING -> FAILED            (dependency cascade)
    /// RUNNING -> UNKNOWN                     (heartbeat sweep)
    /// RUNNING -> PENDING                     (walltime requeue)
    /// {SUCCEEDED, FAILED, KILLED, UNKNOWN} -> PENDING | WAITING   (explicit retry)
    /// any -> KILLED                          (explicit kill)
    /// ```
    pub fn can_transition(&self, to: TaskState) -> bool {
        if to == TaskState::Killed {
            return *self != TaskState::Killed;
        }
        match self {
            TaskState::Waiting => matches!(to, TaskState::Pending | TaskState::Failed),
            TaskState::Pending => matches!(to, TaskState::Running | TaskState::Failed),
            TaskState::Running => matches!(
                to,
                TaskState::Succeeded | TaskState::Failed | TaskState::Unknown | TaskState::Pending
            ),
            TaskState::Succeeded | TaskState::Failed | TaskState::Unknown => {
                matches!(to, TaskState::Pending | TaskState::Waiting)
            }
            TaskState::Killed => matches!(to, TaskState::Pending | TaskState::Waiting),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
