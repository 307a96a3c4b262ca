//! Worker providers
//!
//! A provider allocates worker processes for one manager configuration: the
//! local variant forks subprocesses on this machine, the Slurm variant
//! submits batch jobs and lets the batch system place them. Both expose the
//! same contract to the spawn loop: launch n workers, count the live ones,
//! kill them.
//!
//! Every worker is handed the queue path and the manager digest; the stock
//! worker is the `work` subcommand of this executable, and a custom
//! `worker_command` (a user binary embedding [`crate::Worker`] with its app
//! registry) receives both through `DESIPIPE_QUEUE_PATH` and
//! `DESIPIPE_TM_HASH`.

use anyhow::{Context, Result};
use shared::{EnvironmentSpec, ProviderSpec, TaskState};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variables handed to custom worker commands.
pub const QUEUE_PATH_ENV: &str = "DESIPIPE_QUEUE_PATH";
pub const TM_HASH_ENV: &str = "DESIPIPE_TM_HASH";

/// Everything a provider needs to start workers for one manager group.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub queue_path: PathBuf,
    pub tm_hash: String,
    pub environment: EnvironmentSpec,
}

/// Uniform contract over worker provisioning backends.
pub enum Provider {
    Local(LocalProvider),
    Slurm(SlurmProvider),
}

impl Provider {
    pub fn from_spec(spec: &ProviderSpec) -> Self {
        match spec {
            ProviderSpec::Local { worker_command } => Provider::Local(LocalProvider {
                worker_command: worker_command.clone(),
                children: Vec::new(),
            }),
            ProviderSpec::Slurm {
                worker_command,
                account,
                partition,
                time_limit,
                killed_at_timeout,
            } => Provider::Slurm(SlurmProvider {
                worker_command: worker_command.clone(),
                account: account.clone(),
                partition: partition.clone(),
                time_limit: time_limit.clone(),
                killed_at_timeout: *killed_at_timeout,
                job_name: None,
                jobids: Vec::new(),
            }),
        }
    }

    /// Start `n` workers. Returns how many were actually launched.
    pub async fn launch(&mut self, n: usize, launch: &WorkerLaunch) -> Result<usize> {
        match self {
            Provider::Local(provider) => provider.launch(n, launch).await,
            Provider::Slurm(provider) => provider.launch(n, launch).await,
        }
    }

    /// Number of workers currently holding a slot.
    pub async fn live_workers(&mut self) -> Result<usize> {
        match self {
            Provider::Local(provider) => Ok(provider.live_workers()),
            Provider::Slurm(provider) => provider.live_workers().await,
        }
    }

    /// Terminate all workers of this provider.
    pub async fn kill_workers(&mut self) -> Result<usize> {
        match self {
            Provider::Local(provider) => provider.kill_workers().await,
            Provider::Slurm(provider) => provider.kill_workers().await,
        }
    }

    /// Disposition of a RUNNING task whose heartbeat expired under this
    /// provider; see [`ProviderSpec::stale_task_state`].
    pub fn stale_task_state(&self) -> TaskState {
        match self {
            Provider::Local(_) => TaskState::Unknown,
            Provider::Slurm(provider) => {
                if provider.killed_at_timeout {
                    TaskState::Killed
                } else {
                    TaskState::Pending
                }
            }
        }
    }
}

/// Forks worker subprocesses on the local machine.
pub struct LocalProvider {
    worker_command: Vec<String>,
    children: Vec<Child>,
}

impl LocalProvider {
    async fn launch(&mut self, n: usize, launch: &WorkerLaunch) -> Result<usize> {
        self.reap();

        let argv = resolve_worker_argv(&self.worker_command, launch, true)?;
        let mut launched = 0;
        for _ in 0..n {
            let mut command = build_local_command(&argv, launch);
            match command.spawn() {
                Ok(child) => {
                    debug!("Launched local worker pid {:?}", child.id());
                    self.children.push(child);
                    launched += 1;
                }
                Err(e) => {
                    warn!("Failed to launch local worker: {}", e);
                    break;
                }
            }
        }
        if launched > 0 {
            info!("Launched {} local worker(s)", launched);
        }
        Ok(launched)
    }

    /// Drop children that have exited.
    fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Local worker exited with {}", status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to poll local worker: {}", e);
                false
            }
        });
    }

    fn live_workers(&mut self) -> usize {
        self.reap();
        self.children.len()
    }

    async fn kill_workers(&mut self) -> Result<usize> {
        let mut killed = 0;
        for child in &mut self.children {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill local worker: {}", e);
            } else {
                killed += 1;
            }
        }
        self.children.clear();
        Ok(killed)
    }
}

fn build_local_command(argv: &[String], launch: &WorkerLaunch) -> Command {
    let (program, args) = if launch.environment.commands.is_empty() {
        (argv[0].clone(), argv[1..].to_vec())
    } else {
        // Preparation commands run in a shell before the worker loop starts.
        let mut script = launch.environment.commands.join(" && ");
        script.push_str(" && exec ");
        script.push_str(
            &argv
                .iter()
                .map(|token| shell_quote(token))
                .collect::<Vec<_>>()
                .join(" "),
        );
        ("sh".to_string(), vec!["-c".to_string(), script])
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&launch.environment.vars)
        .env(QUEUE_PATH_ENV, &launch.queue_path)
        .env(TM_HASH_ENV, &launch.tm_hash)
        .stdin(Stdio::null());
    command
}

/// Submits workers as jobs to a Slurm batch system.
pub struct SlurmProvider {
    worker_command: Vec<String>,
    account: Option<String>,
    partition: Option<String>,
    time_limit: String,
    killed_at_timeout: bool,
    job_name: Option<String>,
    jobids: Vec<String>,
}

impl SlurmProvider {
    fn job_name(&mut self, launch: &WorkerLaunch) -> String {
        self.job_name
            .get_or_insert_with(|| format!("desipipe-{}", &launch.tm_hash[..8.min(launch.tm_hash.len())]))
            .clone()
    }

    async fn launch(&mut self, n: usize, launch: &WorkerLaunch) -> Result<usize> {
        let job_name = self.job_name(launch);
        let argv = resolve_worker_argv(&self.worker_command, launch, false)?;

        // One shell line: exported variables, preparation commands, then the
        // worker loop tagged with the Slurm job id.
        let mut script_parts: Vec<String> = launch
            .environment
            .vars
            .iter()
            .map(|(key, value)| format!("export {}={}", key, shell_quote(value)))
            .collect();
        script_parts.extend(launch.environment.commands.iter().cloned());
        script_parts.push(format!(
            "{}=$SLURM_JOB_ID exec {}",
            crate::worker::JOBID_ENV,
            argv.iter()
                .map(|token| shell_quote(token))
                .collect::<Vec<_>>()
                .join(" ")
        ));
        let script = script_parts.join(" && ");

        let mut launched = 0;
        for _ in 0..n {
            let mut command = Command::new("sbatch");
            command
                .arg("--parsable")
                .arg("--job-name")
                .arg(&job_name)
                .arg("-t")
                .arg(&self.time_limit);
            if let Some(account) = &self.account {
                command.arg("-A").arg(account);
            }
            if let Some(partition) = &self.partition {
                command.arg("-p").arg(partition);
            }
            command
                .arg("--wrap")
                .arg(&script)
                .env(QUEUE_PATH_ENV, &launch.queue_path)
                .env(TM_HASH_ENV, &launch.tm_hash);

            let output = command
                .output()
                .await
                .context("Failed to run sbatch; is Slurm available?")?;
            if !output.status.success() {
                warn!(
                    "sbatch failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                break;
            }
            // --parsable prints "jobid" or "jobid;cluster".
            let stdout = String::from_utf8_lossy(&output.stdout);
            let jobid = stdout.trim().split(';').next().unwrap_or_default().to_string();
            if jobid.is_empty() {
                warn!("sbatch returned no job id");
                break;
            }
            debug!("Submitted Slurm worker job {}", jobid);
            self.jobids.push(jobid);
            launched += 1;
        }
        if launched > 0 {
            info!("Submitted {} Slurm worker job(s) as '{}'", launched, job_name);
        }
        Ok(launched)
    }

    async fn live_workers(&mut self) -> Result<usize> {
        let Some(job_name) = &self.job_name else {
            return Ok(0);
        };
        let output = Command::new("squeue")
            .arg("--noheader")
            .arg("--name")
            .arg(job_name)
            .arg("-o")
            .arg("%i")
            .output()
            .await
            .context("Failed to run squeue; is Slurm available?")?;
        if !output.status.success() {
            warn!(
                "squeue failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(self.jobids.len());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let live: Vec<String> = stdout
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        self.jobids.retain(|jobid| live.contains(jobid));
        Ok(live.len())
    }

    async fn kill_workers(&mut self) -> Result<usize> {
        if self.jobids.is_empty() {
            return Ok(0);
        }
        let output = Command::new("scancel")
            .args(&self.jobids)
            .output()
            .await
            .context("Failed to run scancel; is Slurm available?")?;
        if !output.status.success() {
            warn!(
                "scancel failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let killed = self.jobids.len();
        self.jobids.clear();
        Ok(killed)
    }
}

/// Resolve the worker argv: the configured command, or the stock `work`
/// subcommand of the current executable. `local` selects path-based flags
/// over the environment-variable contract used across submission hosts.
fn resolve_worker_argv(
    worker_command: &[String],
    launch: &WorkerLaunch,
    local: bool,
) -> Result<Vec<String>> {
    if !worker_command.is_empty() {
        return Ok(worker_command.to_vec());
    }

    let program = if local {
        std::env::current_exe()
            .context("Failed to resolve current executable for worker launch")?
            .display()
            .to_string()
    } else {
        // On a batch system the submission host's executable path must be
        // valid on the compute node; rely on PATH instead.
        "desipipe".to_string()
    };
    Ok(vec![
        program,
        "work".to_string(),
        "--queue-path".to_string(),
        launch.queue_path.display().to_string(),
        "--tm-hash".to_string(),
        launch.tm_hash.clone(),
    ])
}

/// Quote one token for POSIX sh.
fn shell_quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_alphanumeric() || "-_./=:@%+".contains(c))
    {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', "'\\''"))
    }
}
