//! desipipe command-line interface
//!
//! Management surface over queue files: list queues and tasks, pause/resume,
//! bulk retry, kill, delete, run the spawn scheduler and the stock worker
//! loop. Exit codes: 0 on success, 1 on user-visible errors (unknown queue,
//! invalid filter), 2 on internal errors.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use desipipe::database::format_counts;
use desipipe::queue::{self, Queue};
use desipipe::scheduler::{spawn_detached, SpawnLoop};
use desipipe::{AppRegistry, TaskState, Worker};

/// Environment variable selecting the log filter (tracing syntax).
const LOG_ENV: &str = "DESIPIPE_LOG";
/// Environment variable redirecting logs to a file.
const LOG_FILE_ENV: &str = "DESIPIPE_LOG_FILE";

#[derive(Parser, Debug)]
#[command(name = "desipipe")]
#[command(about = "Persistent DAG-aware task scheduler for batch pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// List queues matching a glob pattern, with task counts per state
    Queues {
        /// Glob pattern over queue names
        #[arg(short = 'q', long = "queue", default_value = "*")]
        pattern: String,
    },
    /// Dump the tasks of a queue
    Tasks {
        #[arg(short = 'q', long = "queue")]
        queue: String,
        /// Only show tasks in this state
        #[arg(long)]
        state: Option<String>,
    },
    /// Pause a queue: no new tasks are handed out, in-flight ones finish
    Pause {
        #[arg(short = 'q', long = "queue")]
        queue: String,
    },
    /// Resume a paused queue
    Resume {
        #[arg(short = 'q', long = "queue")]
        queue: String,
        /// Also start a detached spawn loop
        #[arg(long)]
        spawn: bool,
    },
    /// Move tasks in a given state back to the runnable pool
    Retry {
        #[arg(short = 'q', long = "queue")]
        queue: String,
        /// State to retry (e.g. FAILED, UNKNOWN, SUCCEEDED)
        #[arg(long)]
        state: String,
    },
    /// Run the scheduler loop for a queue
    Spawn {
        #[arg(short = 'q', long = "queue")]
        queue: String,
        /// Detach the loop as a background process
        #[arg(long)]
        spawn: bool,
        /// Scan interval in seconds
        #[arg(long)]
        timestep: Option<f64>,
    },
    /// Mark all unfinished tasks KILLED
    Kill {
        #[arg(short = 'q', long = "queue")]
        queue: String,
    },
    /// Delete queues matching a glob pattern
    Delete {
        #[arg(short = 'q', long = "queue")]
        pattern: String,
        /// Required: deletion is destructive
        #[arg(long)]
        force: bool,
    },
    /// Run the stock worker loop (started by providers)
    Work {
        #[arg(short = 'q', long = "queue")]
        queue: Option<String>,
        /// Full path to the queue file (alternative to -q)
        #[arg(long)]
        queue_path: Option<PathBuf>,
        /// Only claim tasks of this manager configuration
        #[arg(long)]
        tm_hash: Option<String>,
        /// Exit after this long without a claim
        #[arg(long)]
        idle_timeout: Option<f64>,
    },
}

/// Errors surfaced to the user (exit 1) versus internal failures (exit 2).
enum CliError {
    User(anyhow::Error),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for CliError {
    fn from(error: anyhow::Error) -> Self {
        CliError::Internal(error)
    }
}

fn user<E: Into<anyhow::Error>>(error: E) -> CliError {
    CliError::User(error.into())
}

#[tokio::main]
async fn main() {
    let _guard = init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {}
        Err(CliError::User(e)) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
        Err(CliError::Internal(e)) => {
            error!("internal error: {:#}", e);
            eprintln!("internal error: {:#}", e);
            std::process::exit(2);
        }
    }
}

/// Set up tracing: filter from `DESIPIPE_LOG`, optional file output via
/// `DESIPIPE_LOG_FILE`. The returned guard must live for the process.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Ok(path) = std::env::var(LOG_FILE_ENV) {
        let path = PathBuf::from(path);
        let dir = path.parent().unwrap_or(&path).to_path_buf();
        let file = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "desipipe.log".to_string());
        let appender = tracing_appender::rolling::never(dir, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        None
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        CliCommand::Queues { pattern } => cmd_queues(&pattern).await,
        CliCommand::Tasks { queue, state } => cmd_tasks(&queue, state.as_deref()).await,
        CliCommand::Pause { queue } => {
            let queue = open_queue(&queue)?;
            queue.pause().await?;
            println!("Queue '{}' paused", queue.name());
            Ok(())
        }
        CliCommand::Resume { queue, spawn } => {
            let handle = open_queue(&queue)?;
            handle.resume().await?;
            println!("Queue '{}' resumed", handle.name());
            if spawn {
                let pid = spawn_detached(handle.name(), None, shared::defaults::default_timestep())?;
                println!("Spawn loop detached as pid {}", pid);
            }
            Ok(())
        }
        CliCommand::Retry { queue, state } => cmd_retry(&queue, &state).await,
        CliCommand::Spawn {
            queue,
            spawn,
            timestep,
        } => cmd_spawn(&queue, spawn, timestep).await,
        CliCommand::Kill { queue } => {
            let queue = open_queue(&queue)?;
            let killed = queue.kill_all().await?;
            println!("Killed {} task(s) in queue '{}'", killed, queue.name());
            Ok(())
        }
        CliCommand::Delete { pattern, force } => cmd_delete(&pattern, force).await,
        CliCommand::Work {
            queue,
            queue_path,
            tm_hash,
            idle_timeout,
        } => cmd_work(queue, queue_path, tm_hash, idle_timeout).await,
    }
}

fn open_queue(name: &str) -> Result<Queue, CliError> {
    Queue::open(name, None).map_err(user)
}

async fn cmd_queues(pattern: &str) -> Result<(), CliError> {
    let names = queue::list_queues(pattern, None).map_err(user)?;
    if names.is_empty() {
        println!("No queues match '{}'", pattern);
        return Ok(());
    }
    for name in names {
        let queue = Queue::open(&name, None)?;
        let state = queue.state().await?;
        let counts = queue.counts().await?;
        println!("{:24} [{:6}] {}", name, state.as_str(), format_counts(&counts));
    }
    Ok(())
}

async fn cmd_tasks(queue: &str, state: Option<&str>) -> Result<(), CliError> {
    let state = state
        .map(|s| TaskState::from_str(&s.to_uppercase()))
        .transpose()
        .map_err(user)?;
    let queue = open_queue(queue)?;

    let tasks = queue.tasks(state).await?;
    println!("{} task(s) in queue '{}'", tasks.len(), queue.name());
    for task in tasks {
        let created = format_timestamp(task.t_created);
        print!(
            "{}  {:9}  {:20}  errno={:<4}  created={}",
            task.id, task.state, task.app_name, task.errno, created
        );
        if task.state.is_failed() && !task.err.is_empty() {
            print!("  err={}", shared::utils::truncate_string(task.err.trim(), 80));
        }
        println!();
    }
    Ok(())
}

fn format_timestamp(timestamp: f64) -> String {
    chrono::DateTime::from_timestamp(timestamp as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{:.0}", timestamp))
}

async fn cmd_retry(queue: &str, state: &str) -> Result<(), CliError> {
    let state = TaskState::from_str(&state.to_uppercase()).map_err(user)?;
    let queue = open_queue(queue)?;

    let report = queue.retry(&[state]).await?;
    println!("Retried {} task(s) in queue '{}'", report.retried, queue.name());
    if report.skipped_running > 0 {
        println!(
            "Skipped {} RUNNING task(s); retry them after they settle",
            report.skipped_running
        );
    }
    Ok(())
}

async fn cmd_spawn(queue: &str, detach: bool, timestep: Option<f64>) -> Result<(), CliError> {
    let handle = open_queue(queue)?;
    if detach {
        let pid = spawn_detached(
            handle.name(),
            None,
            timestep.unwrap_or_else(shared::defaults::default_timestep),
        )?;
        println!("Spawn loop detached as pid {}", pid);
        return Ok(());
    }

    let mut spawn_loop = SpawnLoop::new(handle, timestep);
    spawn_loop.run().await?;
    Ok(())
}

async fn cmd_delete(pattern: &str, force: bool) -> Result<(), CliError> {
    let names = queue::list_queues(pattern, None).map_err(user)?;
    if names.is_empty() {
        return Err(user(anyhow::anyhow!("no queues match '{}'", pattern)));
    }
    if !force {
        return Err(user(anyhow::anyhow!(
            "deleting {} queue(s) ({}) requires --force",
            names.len(),
            names.join(", ")
        )));
    }
    for name in names {
        let queue = Queue::open(&name, None)?;
        queue.delete().await?;
        println!("Deleted queue '{}'", name);
    }
    Ok(())
}

async fn cmd_work(
    name: Option<String>,
    queue_path: Option<PathBuf>,
    tm_hash: Option<String>,
    idle_timeout: Option<f64>,
) -> Result<(), CliError> {
    let queue = if let Some(path) = queue_path {
        Queue::from_path(&path).map_err(user)?
    } else if let Some(name) = name {
        open_queue(&name)?
    } else if let Ok(path) = std::env::var(desipipe::provider::QUEUE_PATH_ENV) {
        Queue::from_path(&PathBuf::from(path)).map_err(user)?
    } else {
        return Err(user(anyhow::anyhow!(
            "work needs a queue: pass -q, --queue-path, or set {}",
            desipipe::provider::QUEUE_PATH_ENV
        )));
    };
    let tm_hash = tm_hash.or_else(|| std::env::var(desipipe::provider::TM_HASH_ENV).ok());

    // The stock worker has no user apps registered; it executes bash tasks,
    // which are self-contained in their rows.
    let registry = Arc::new(RwLock::new(AppRegistry::default()));
    let mut worker = Worker::new(queue, registry, tm_hash);
    if let Some(seconds) = idle_timeout {
        worker = worker.with_idle_timeout(seconds);
    }
    let report = worker.run().await?;
    info!(
        "Worker finished: {} executed, {} succeeded, {} failed",
        report.executed, report.succeeded, report.failed
    );
    Ok(())
}

// Unit tests for argument parsing.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spawn() {
        let cli = Cli::try_parse_from(["desipipe", "spawn", "-q", "nightly", "--timestep", "5"])
            .unwrap();
        match cli.command {
            CliCommand::Spawn {
                queue,
                spawn,
                timestep,
            } => {
                assert_eq!(queue, "nightly");
                assert!(!spawn);
                assert_eq!(timestep, Some(5.0));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_retry_requires_state() {
        assert!(Cli::try_parse_from(["desipipe", "retry", "-q", "nightly"]).is_err());
        let cli =
            Cli::try_parse_from(["desipipe", "retry", "-q", "nightly", "--state", "FAILED"])
                .unwrap();
        match cli.command {
            CliCommand::Retry { state, .. } => assert_eq!(state, "FAILED"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_queues_default_pattern() {
        let cli = Cli::try_parse_from(["desipipe", "queues"]).unwrap();
        match cli.command {
            CliCommand::Queues { pattern } => assert_eq!(pattern, "*"),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
