//! Task rows and future handles
//!
//! A [`Task`] mirrors one row of the queue store. A [`TaskFuture`] is the
//! in-memory handle returned by a submission: it knows only the task id and
//! the queue, and lazily materializes `result()`, `out()` and `err()` from
//! the store, so handles remain valid across processes.

use crate::queue::Queue;
use serde_json::Value;
use shared::state::errno;
use shared::{defaults, utils, PipelineError, TaskState};
use std::time::Duration;
use tracing::debug;

/// App flavor recorded in every task row.
///
/// `Func` apps execute a registered in-process handler; `Bash` apps render a
/// command template and execute it as a subprocess, so any stock worker can
/// run them without user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    Func,
    Bash,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::Func => "func",
            AppKind::Bash => "bash",
        }
    }

    pub fn from_str(s: &str) -> shared::Result<Self> {
        match s {
            "func" => Ok(AppKind::Func),
            "bash" => Ok(AppKind::Bash),
            _ => Err(anyhow::anyhow!("Invalid app kind: {}", s)),
        }
    }
}

/// One task row of the queue store.
#[derive(Debug, Clone)]
pub struct Task {
    /// Content identity, 128-bit hex. Primary key.
    pub id: String,
    pub app_name: String,
    /// Hash of the registered app source and version.
    pub app_hash: String,
    /// Registered app source: normalized source text for func apps, the JSON
    /// command template for bash apps.
    pub source: String,
    pub kind: AppKind,
    /// Canonical JSON blob of positional arguments.
    pub args: Vec<u8>,
    /// Canonical JSON blob of keyword arguments.
    pub kwargs: Vec<u8>,
    /// Ids of tasks referenced by dependency placeholders in the arguments.
    pub deps: Vec<String>,
    pub state: TaskState,
    /// Present iff state is SUCCEEDED.
    pub result: Option<Vec<u8>>,
    pub errno: i64,
    /// Captured stdout, updated while RUNNING.
    pub out: String,
    /// Captured stderr / failure trace, updated while RUNNING.
    pub err: String,
    /// Worker identifier while claimed; None otherwise.
    pub jobid: Option<String>,
    /// Serialized configuration of the owning TaskManager.
    pub tm_config: Vec<u8>,
    /// Digest of `tm_config`, used by workers to claim matching tasks.
    pub tm_hash: String,
    pub t_created: f64,
    pub t_started: Option<f64>,
    pub t_finished: Option<f64>,
    pub t_heartbeat: Option<f64>,
}

impl Task {
    /// Build a fresh, unclaimed row. The state is WAITING when there are
    /// dependencies and PENDING otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        app_name: String,
        app_hash: String,
        source: String,
        kind: AppKind,
        args: Vec<u8>,
        kwargs: Vec<u8>,
        deps: Vec<String>,
        tm_config: Vec<u8>,
        tm_hash: String,
    ) -> Self {
        let state = if deps.is_empty() {
            TaskState::Pending
        } else {
            TaskState::Waiting
        };
        Self {
            id,
            app_name,
            app_hash,
            source,
            kind,
            args,
            kwargs,
            deps,
            state,
            result: None,
            errno: errno::OK,
            out: String::new(),
            err: String::new(),
            jobid: None,
            tm_config,
            tm_hash,
            t_created: utils::current_timestamp(),
            t_started: None,
            t_finished: None,
            t_heartbeat: None,
        }
    }
}

/// Final outcome a worker writes back for a claimed task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// SUCCEEDED or FAILED.
    pub state: TaskState,
    pub result: Option<Vec<u8>>,
    pub errno: i64,
    pub out: String,
    pub err: String,
}

impl TaskOutcome {
    pub fn success(result: Vec<u8>, out: String, err: String) -> Self {
        Self {
            state: TaskState::Succeeded,
            result: Some(result),
            errno: errno::OK,
            out,
            err,
        }
    }

    pub fn failure(errno: i64, out: String, err: String) -> Self {
        Self {
            state: TaskState::Failed,
            result: None,
            errno,
            out,
            err,
        }
    }
}

/// Handle for awaiting a task's result.
///
/// Holds the task id and a queue handle; all accessors read through to the
/// store, so a future created in one process observes completions from any
/// other process sharing the queue file.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    id: String,
    queue: Queue,
}

impl TaskFuture {
    pub fn new(id: String, queue: Queue) -> Self {
        Self { id, queue }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Placeholder value to pass this future as an argument to another app.
    pub fn as_value(&self) -> Value {
        shared::codec::dep_placeholder(&self.id)
    }

    /// Current state of the underlying task.
    pub async fn state(&self) -> shared::Result<TaskState> {
        let task = self.load().await?;
        Ok(task.state)
    }

    /// Captured stdout so far. Live while the task is RUNNING.
    pub async fn out(&self) -> shared::Result<String> {
        Ok(self.load().await?.out)
    }

    /// Captured stderr so far. Live while the task is RUNNING.
    pub async fn err(&self) -> shared::Result<String> {
        Ok(self.load().await?.err)
    }

    /// Block until the task reaches a settled state and return its result.
    ///
    /// Polls the store at an adaptive interval, starting at
    /// [`defaults::default_poll_min`] and backing off to
    /// [`defaults::default_poll_max`]. Returns the decoded result blob on
    /// SUCCEEDED; fails with [`PipelineError::TaskFailed`] on FAILED, KILLED,
    /// or on UNKNOWN (a lost task will not settle without an explicit retry).
    pub async fn result(&self) -> shared::Result<Value> {
        let mut interval = defaults::default_poll_min();
        loop {
            let task = self.load().await?;
            match task.state {
                TaskState::Succeeded => {
                    let blob = task.result.ok_or_else(|| {
                        PipelineError::QueueCorruption(format!(
                            "task {} SUCCEEDED without a result blob",
                            task.id
                        ))
                    })?;
                    return shared::codec::decode_result(&blob);
                }
                TaskState::Failed | TaskState::Killed | TaskState::Unknown => {
                    return Err(PipelineError::TaskFailed {
                        id: task.id,
                        state: task.state,
                        errno: task.errno,
                        message: utils::truncate_string(&task.err, 512),
                    }
                    .into());
                }
                other => {
                    debug!("Task {} is {}, polling again in {:.1}s", self.id, other, interval);
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
            interval = (interval * 1.5).min(defaults::default_poll_max());
        }
    }

    async fn load(&self) -> shared::Result<Task> {
        self.queue.task(&self.id).await?.ok_or_else(|| {
            PipelineError::QueueCorruption(format!("task {} not found in queue", self.id)).into()
        })
    }
}
