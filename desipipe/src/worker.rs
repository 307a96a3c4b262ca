//! Worker runtime
//!
//! A worker loops `claim -> execute -> finish`, exiting when the queue is
//! paused or after `worker_idle_timeout` without a successful claim. While a
//! task runs, its captured stdout/stderr are flushed to the store on every
//! heartbeat; a heartbeat that fails means the row was finalized externally
//! (killed), and the execution is abandoned.
//!
//! Func apps are dispatched to the handler registered in this process, after
//! checking that the row's `app_hash` matches the registered source. Bash
//! apps are rendered from the command template persisted in the row and run
//! as a subprocess, so they need no registry at all.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use shared::state::errno;
use shared::{codec, defaults, hashing, PipelineError, TaskManagerConfig, TaskState};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::database::{ClaimFilter, QueueState};
use crate::manager::{AppRegistry, OutputBuffers, TaskContext, TaskInput};
use crate::queue::Queue;
use crate::task::{AppKind, Task, TaskOutcome};

/// Interval between claim attempts while idle.
const CLAIM_RETRY_SECONDS: f64 = 0.5;

/// Environment variable carrying a provider-assigned job identifier.
pub const JOBID_ENV: &str = "DESIPIPE_JOBID";

/// Summary of one worker run.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerReport {
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

enum Exec {
    Success { result: Vec<u8> },
    Failure { errno: i64 },
}

/// A process executing tasks from one queue, one at a time.
pub struct Worker {
    queue: Queue,
    registry: Arc<RwLock<AppRegistry>>,
    tm_hash: Option<String>,
    idle_timeout: Option<f64>,
    jobid: String,
}

impl Worker {
    pub fn new(queue: Queue, registry: Arc<RwLock<AppRegistry>>, tm_hash: Option<String>) -> Self {
        let jobid = std::env::var(JOBID_ENV).unwrap_or_else(|_| {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
            format!("{}-{}", host, std::process::id())
        });
        Self {
            queue,
            registry,
            tm_hash,
            idle_timeout: None,
            jobid,
        }
    }

    /// Override the idle timeout taken from defaults.
    pub fn with_idle_timeout(mut self, seconds: f64) -> Self {
        self.idle_timeout = Some(seconds);
        self
    }

    pub fn jobid(&self) -> &str {
        &self.jobid
    }

    fn claim_filter(&self) -> ClaimFilter {
        ClaimFilter {
            tm_hash: self.tm_hash.clone(),
            known_apps: Some(self.registry.read().unwrap().known_func_apps()),
        }
    }

    /// Run until the queue pauses or no task is claimed for the idle timeout.
    pub async fn run(&self) -> Result<WorkerReport> {
        let idle_timeout = self
            .idle_timeout
            .unwrap_or_else(defaults::default_worker_idle_timeout);
        info!("Worker {} starting on queue '{}'", self.jobid, self.queue.name());

        let mut report = WorkerReport::default();
        let mut idle_since: Option<tokio::time::Instant> = None;

        loop {
            if self.queue.state().await? == QueueState::Paused {
                info!("Queue '{}' is paused, worker {} exiting", self.queue.name(), self.jobid);
                break;
            }

            match self.queue.claim(&self.claim_filter(), &self.jobid).await? {
                Some(task) => {
                    idle_since = None;
                    report.executed += 1;
                    if self.execute(task).await? {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                None => {
                    let now = tokio::time::Instant::now();
                    let since = *idle_since.get_or_insert(now);
                    if (now - since).as_secs_f64() >= idle_timeout {
                        debug!("Worker {} idle for {:.0}s, exiting", self.jobid, idle_timeout);
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs_f64(CLAIM_RETRY_SECONDS)).await;
                }
            }
        }

        info!(
            "Worker {} done: {} executed, {} succeeded, {} failed",
            self.jobid, report.executed, report.succeeded, report.failed
        );
        Ok(report)
    }

    /// Claim and execute a single task. Returns false when nothing was
    /// eligible. Mostly useful for embedding and tests.
    pub async fn run_once(&self) -> Result<bool> {
        match self.queue.claim(&self.claim_filter(), &self.jobid).await? {
            Some(task) => {
                self.execute(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Execute a claimed task to completion. Returns whether it SUCCEEDED.
    async fn execute(&self, task: Task) -> Result<bool> {
        debug!("Worker {} executing task {} ({})", self.jobid, task.id, task.app_name);
        let config = TaskManagerConfig::from_blob(&task.tm_config).unwrap_or_default();

        let ctx = TaskContext::default();
        let buffers = ctx.buffers();

        let heartbeat = self.heartbeat_loop(
            task.id.clone(),
            buffers.clone(),
            config.scheduler.heartbeat_interval_seconds,
        );

        tokio::select! {
            exec = self.run_task(&task, &ctx, &config) => {
                let (out, err) = snapshot(&buffers);
                let outcome = match exec {
                    Exec::Success { result } => TaskOutcome::success(result, out, err),
                    Exec::Failure { errno } => TaskOutcome::failure(errno, out, err),
                };
                match self.queue.finish(&task.id, &outcome).await {
                    Ok(()) => Ok(outcome.state == TaskState::Succeeded),
                    // The row left RUNNING between the last heartbeat and
                    // completion (killed or retried); the result is dropped,
                    // the same as when a heartbeat is refused mid-run.
                    Err(e) if is_invalid_transition(&e) => {
                        warn!(
                            "Task {} was finalized externally, dropping its result: {}",
                            task.id, e
                        );
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
            _ = heartbeat => {
                // The row left RUNNING under us (killed or retried); nothing
                // to record.
                warn!("Task {} was finalized externally, abandoning execution", task.id);
                Ok(false)
            }
        }
    }

    /// Periodically stamp the heartbeat and flush captured output. Completes
    /// only when a heartbeat is refused, i.e. the task is no longer RUNNING.
    async fn heartbeat_loop(
        &self,
        id: String,
        buffers: Arc<Mutex<OutputBuffers>>,
        interval_seconds: f64,
    ) {
        loop {
            tokio::time::sleep(Duration::from_secs_f64(interval_seconds)).await;
            let (out, err) = snapshot(&buffers);
            if let Err(e) = self.queue.heartbeat(&id, Some(&out), Some(&err)).await {
                debug!("Heartbeat for task {} refused: {}", id, e);
                return;
            }
        }
    }

    async fn run_task(&self, task: &Task, ctx: &TaskContext, config: &TaskManagerConfig) -> Exec {
        let input = match self.materialize_input(task).await {
            Ok(input) => input,
            Err(e) => return self.fail(ctx, errno_for(&e), &e),
        };

        match task.kind {
            AppKind::Func => self.run_func(task, ctx, input).await,
            AppKind::Bash => self.run_bash(task, ctx, input, config).await,
        }
    }

    /// Decode the argument blobs and replace dependency placeholders with
    /// the referenced result values. Every dependency must be SUCCEEDED;
    /// the claim logic guarantees this, so anything else is corruption.
    async fn materialize_input(&self, task: &Task) -> Result<TaskInput> {
        let args = codec::decode_args(&task.args)?;
        let kwargs = codec::decode_kwargs(&task.kwargs)?;

        let mut results: BTreeMap<String, Value> = BTreeMap::new();
        for dep in &task.deps {
            let row = self
                .queue
                .task(dep)
                .await?
                .ok_or_else(|| PipelineError::QueueCorruption(format!(
                    "dependency {} of task {} is missing",
                    dep, task.id
                )))?;
            if row.state != TaskState::Succeeded {
                return Err(PipelineError::DependencyFailed { id: dep.clone() }.into());
            }
            let blob = row.result.ok_or_else(|| {
                PipelineError::QueueCorruption(format!(
                    "dependency {} SUCCEEDED without a result blob",
                    dep
                ))
            })?;
            results.insert(dep.clone(), codec::decode_result(&blob)?);
        }

        let args = args
            .iter()
            .map(|value| codec::substitute_deps(value, &results))
            .collect::<Result<Vec<_>>>()?;
        let kwargs = kwargs
            .iter()
            .map(|(key, value)| Ok((key.clone(), codec::substitute_deps(value, &results)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(TaskInput { args, kwargs })
    }

    async fn run_func(&self, task: &Task, ctx: &TaskContext, input: TaskInput) -> Exec {
        let registered = {
            let registry = self.registry.read().unwrap();
            registry.get(&task.app_name).cloned()
        };
        let Some(registered) = registered else {
            let e = anyhow::anyhow!(
                "app '{}' is not registered in this worker",
                task.app_name
            );
            return self.fail(ctx, hashing::stable_errno(&format!("{:#}", e)), &e);
        };
        if registered.app_hash != task.app_hash {
            let e = anyhow::anyhow!(
                "app '{}' source changed: registered hash does not match task row",
                task.app_name
            );
            return self.fail(ctx, hashing::stable_errno(&format!("{:#}", e)), &e);
        }
        let Some(handler) = registered.handler else {
            let e = anyhow::anyhow!("app '{}' has no executable handler", task.app_name);
            return self.fail(ctx, hashing::stable_errno(&format!("{:#}", e)), &e);
        };

        // Handlers are synchronous user code; run them off the async
        // executor and survive panics.
        let handler_ctx = ctx.clone();
        let joined = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(|| handler(&handler_ctx, &input)))
        })
        .await;

        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(&panic);
                let e = anyhow::anyhow!("app '{}' panicked: {}", task.app_name, message);
                return self.fail(ctx, hashing::stable_errno(&message), &e);
            }
            Err(e) => {
                let e = anyhow::anyhow!("app '{}' execution task failed: {}", task.app_name, e);
                return self.fail(ctx, hashing::stable_errno(&format!("{:#}", e)), &e);
            }
        };

        match result {
            Ok(value) => match codec::encode_result(&value) {
                Ok(blob) => Exec::Success { result: blob },
                Err(e) => self.fail(ctx, errno_for(&e), &e),
            },
            Err(e) => {
                let message = format!("{:#}", e);
                self.fail(ctx, hashing::stable_errno(&message), &e)
            }
        }
    }

    async fn run_bash(
        &self,
        task: &Task,
        ctx: &TaskContext,
        input: TaskInput,
        config: &TaskManagerConfig,
    ) -> Exec {
        let template: Vec<String> = match serde_json::from_str(&task.source) {
            Ok(tokens) => tokens,
            Err(e) => {
                let e = anyhow::anyhow!("invalid bash template for app '{}': {}", task.app_name, e);
                return self.fail(ctx, errno_for(&e), &e);
            }
        };
        let argv = match render_template(&template, &input) {
            Ok(argv) => argv,
            Err(e) => return self.fail(ctx, errno_for(&e), &e),
        };
        if argv.is_empty() {
            let e = anyhow::anyhow!("bash app '{}' rendered an empty command", task.app_name);
            return self.fail(ctx, errno_for(&e), &e);
        }
        debug!("Task {} running command: {:?}", task.id, argv);

        let spawned = Command::new(&argv[0])
            .args(&argv[1..])
            .envs(&config.environment.vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn command {:?}", argv[0]));
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return self.fail(ctx, errno_for(&e), &e),
        };

        // Drain both pipes concurrently into the shared buffers so
        // heartbeats flush partial output while the command runs, and a full
        // pipe never stalls the child.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::join!(
            async {
                if let Some(pipe) = stdout {
                    drain_pipe(pipe, ctx.buffers(), false).await;
                }
            },
            async {
                if let Some(pipe) = stderr {
                    drain_pipe(pipe, ctx.buffers(), true).await;
                }
            }
        );

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                let e = anyhow::anyhow!("failed to wait on command: {}", e);
                return self.fail(ctx, errno_for(&e), &e);
            }
        };

        let code = exit_code(&status);
        if code == 0 {
            match codec::encode_result(&json!(0)) {
                Ok(blob) => Exec::Success { result: blob },
                Err(e) => self.fail(ctx, errno_for(&e), &e),
            }
        } else {
            ctx.eprint(&format!("command exited with status {}", code));
            Exec::Failure { errno: code }
        }
    }

    /// Record a failure message on the task's stderr buffer.
    fn fail(&self, ctx: &TaskContext, errno: i64, error: &anyhow::Error) -> Exec {
        ctx.eprint(&format!("{:#}", error));
        Exec::Failure { errno }
    }
}

fn snapshot(buffers: &Arc<Mutex<OutputBuffers>>) -> (String, String) {
    let buffers = buffers.lock().unwrap();
    (buffers.out.clone(), buffers.err.clone())
}

fn is_invalid_transition(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidTransition { .. })
    )
}

fn errno_for(error: &anyhow::Error) -> i64 {
    // Dependency failures keep their distinguished errno; everything else
    // derives a stable value from the message.
    if let Some(PipelineError::DependencyFailed { .. }) = error.downcast_ref::<PipelineError>() {
        return errno::DEPENDENCY_FAILED;
    }
    hashing::stable_errno(&format!("{:#}", error))
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn drain_pipe<R>(pipe: R, buffers: Arc<Mutex<OutputBuffers>>, is_err: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut buffers = buffers.lock().unwrap();
        let target = if is_err { &mut buffers.err } else { &mut buffers.out };
        target.push_str(&line);
        target.push('\n');
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code as i64,
        // Terminated by a signal; report it shell-style.
        None => 128 + status.signal().unwrap_or(0) as i64,
    }
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i64 {
    status.code().unwrap_or(-1) as i64
}

/// Render a bash command template against materialized inputs.
///
/// Placeholders follow the usual brace syntax: `{}` consumes the next
/// positional argument, `{2}` a specific one, `{name}` a keyword argument.
/// An optional `:.Nf` suffix formats a number with fixed precision. Doubled
/// braces escape literals.
pub fn render_template(template: &[String], input: &TaskInput) -> Result<Vec<String>> {
    let mut auto_index = 0usize;
    template
        .iter()
        .map(|token| render_token(token, input, &mut auto_index))
        .collect()
}

fn render_token(token: &str, input: &TaskInput, auto_index: &mut usize) -> Result<String> {
    let mut out = String::new();
    let mut chars = token.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut spec = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    spec.push(inner);
                }
                if !closed {
                    return Err(PipelineError::Validation(format!(
                        "unbalanced braces in template token '{}'",
                        token
                    ))
                    .into());
                }
                out.push_str(&render_spec(&spec, input, auto_index)?);
            }
            '}' => {
                return Err(PipelineError::Validation(format!(
                    "unbalanced braces in template token '{}'",
                    token
                ))
                .into());
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn render_spec(spec: &str, input: &TaskInput, auto_index: &mut usize) -> Result<String> {
    let (key, format) = match spec.split_once(':') {
        Some((key, format)) => (key, Some(format)),
        None => (spec, None),
    };

    let value = if key.is_empty() {
        let value = input.arg(*auto_index);
        *auto_index += 1;
        value
    } else if let Ok(index) = key.parse::<usize>() {
        input.arg(index)
    } else {
        input.kwarg(key)
    };
    let value = value.ok_or_else(|| {
        PipelineError::Validation(format!("template placeholder '{{{}}}' has no argument", spec))
    })?;

    format_value(value, format)
}

fn format_value(value: &Value, format: Option<&str>) -> Result<String> {
    match format {
        None => Ok(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        Some(spec) if spec.starts_with('.') && spec.ends_with('f') => {
            let precision: usize = spec[1..spec.len() - 1]
                .parse()
                .map_err(|_| PipelineError::Validation(format!("invalid format '{}'", spec)))?;
            let number = value.as_f64().ok_or_else(|| {
                PipelineError::Validation(format!("format '{}' needs a numeric value", spec))
            })?;
            Ok(format!("{:.*}", precision, number))
        }
        Some(spec) => {
            Err(PipelineError::Validation(format!("unsupported format '{}'", spec)).into())
        }
    }
}
