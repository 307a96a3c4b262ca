//! TaskManager configuration model
//!
//! A [`TaskManagerConfig`] bundles everything a worker needs to execute tasks
//! on behalf of a manager: the environment to restore, the scheduler limits
//! and the provider the workers are provisioned through. The whole bundle is
//! serialized into every task row (`tm_config`), so workers started by a
//! different process reconstruct it from the store alone.

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Complete manager configuration persisted with every task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskManagerConfig {
    /// Environment restored before task execution.
    #[serde(default)]
    pub environment: EnvironmentSpec,
    /// Scheduler limits and timing.
    #[serde(default)]
    pub scheduler: SchedulerSpec,
    /// Where workers run.
    #[serde(default)]
    pub provider: ProviderSpec,
}

impl TaskManagerConfig {
    /// Serialize to the canonical JSON blob stored in task rows.
    ///
    /// Field order is fixed by the struct definitions and maps use `BTreeMap`,
    /// so equal configurations always serialize to equal bytes.
    pub fn to_blob(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_blob(blob: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }

    /// Load from a TOML file (the `manager.toml` consumed by the CLI).
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: TaskManagerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Stable digest identifying this configuration in the store.
    pub fn digest(&self) -> crate::Result<String> {
        Ok(crate::hashing::config_hash(&self.to_blob()?))
    }

    /// Validate field ranges. Called after deserialization and before use.
    pub fn validate(&self) -> crate::Result<()> {
        if self.scheduler.max_workers == 0 {
            return Err(crate::PipelineError::Validation(
                "max_workers must be at least 1".to_string(),
            )
            .into());
        }
        if self.scheduler.timestep_seconds <= 0.0 {
            return Err(crate::PipelineError::Validation(
                "timestep_seconds must be positive".to_string(),
            )
            .into());
        }
        if self.scheduler.heartbeat_timeout_seconds <= self.scheduler.heartbeat_interval_seconds {
            return Err(crate::PipelineError::Validation(
                "heartbeat_timeout_seconds must exceed heartbeat_interval_seconds".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Environment variables and preparation commands applied when a worker is
/// launched. Variables are exported into the worker process; commands are
/// shell statements the provider runs before starting the worker loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentSpec {
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Scheduler limits and timing for one manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSpec {
    /// Maximum number of concurrent workers for this manager's tasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Scan interval of the spawn loop in seconds.
    #[serde(default = "default_timestep")]
    pub timestep_seconds: f64,
    /// A RUNNING task whose heartbeat is older than this is considered lost.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: f64,
    /// Interval between worker heartbeats and output flushes.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: f64,
    /// A worker exits after this long without a successful claim.
    #[serde(default = "default_worker_idle_timeout")]
    pub worker_idle_timeout_seconds: f64,
    /// A paused spawn loop exits after this long with no live workers.
    #[serde(default = "default_idle_grace")]
    pub idle_grace_seconds: f64,
}

impl Default for SchedulerSpec {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            timestep_seconds: default_timestep(),
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            worker_idle_timeout_seconds: default_worker_idle_timeout(),
            idle_grace_seconds: default_idle_grace(),
        }
    }
}

/// Where workers run. Tagged so configuration files select the variant with
/// `type = "local"` or `type = "slurm"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderSpec {
    /// Fork worker subprocesses on the local machine.
    Local {
        /// Command used to start one worker. Empty means the stock
        /// `desipipe work` worker of the current executable.
        #[serde(default)]
        worker_command: Vec<String>,
    },
    /// Submit workers as jobs to a Slurm batch system.
    Slurm {
        #[serde(default)]
        worker_command: Vec<String>,
        /// Account passed to `sbatch -A`.
        #[serde(default)]
        account: Option<String>,
        /// Partition passed to `sbatch -p`.
        #[serde(default)]
        partition: Option<String>,
        /// Walltime limit passed to `sbatch -t`.
        #[serde(default = "default_slurm_time_limit")]
        time_limit: String,
        /// Whether a task interrupted by walltime expiry stays KILLED. When
        /// false the sweep re-queues the task as PENDING instead, which is
        /// only safe for idempotent workloads.
        #[serde(default)]
        killed_at_timeout: bool,
    },
}

impl Default for ProviderSpec {
    fn default() -> Self {
        ProviderSpec::Local {
            worker_command: Vec::new(),
        }
    }
}

impl ProviderSpec {
    /// State a RUNNING task is swept into when its heartbeat expires.
    ///
    /// Local workers have no walltime, so a stale heartbeat means the worker
    /// was lost and the task needs an explicit retry. A batch slot usually
    /// dies from walltime expiry; `killed_at_timeout` selects between the
    /// terminal KILLED and a re-queue as PENDING for idempotent workloads.
    pub fn stale_task_state(&self) -> crate::TaskState {
        match self {
            ProviderSpec::Local { .. } => crate::TaskState::Unknown,
            ProviderSpec::Slurm {
                killed_at_timeout: true,
                ..
            } => crate::TaskState::Killed,
            ProviderSpec::Slurm {
                killed_at_timeout: false,
                ..
            } => crate::TaskState::Pending,
        }
    }
}
