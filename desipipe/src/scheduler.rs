//! The spawn loop
//!
//! `desipipe spawn` runs this loop in its own process. Every `timestep` it
//! sweeps lost workers, propagates dependency readiness and failure, and
//! tops up workers per manager configuration through the configured
//! provider. It never executes user code itself and holds no state the
//! store does not: killing and restarting it mid-run is safe, the next scan
//! resumes from the rows.

use anyhow::Result;
use shared::{defaults, TaskManagerConfig, TaskState};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::database::{format_counts, QueueState};
use crate::provider::{Provider, WorkerLaunch};
use crate::queue::Queue;

/// One manager configuration observed in the queue, with its provider.
struct ManagerSlot {
    config: TaskManagerConfig,
    provider: Provider,
}

/// Summary of one scheduler tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    /// The loop has nothing left to do and should exit.
    pub stop: bool,
    /// WAITING tasks promoted to PENDING.
    pub promoted: usize,
    /// Tasks failed by dependency cascade.
    pub cascaded: usize,
    /// RUNNING tasks reclassified after a lost heartbeat.
    pub swept: usize,
    /// Workers launched this tick.
    pub launched: usize,
}

/// The scheduler process driving one queue.
pub struct SpawnLoop {
    queue: Queue,
    timestep: f64,
    slots: HashMap<String, ManagerSlot>,
    paused_since: Option<Instant>,
}

impl SpawnLoop {
    pub fn new(queue: Queue, timestep: Option<f64>) -> Self {
        Self {
            queue,
            timestep: timestep.unwrap_or_else(defaults::default_timestep),
            slots: HashMap::new(),
            paused_since: None,
        }
    }

    /// Run ticks until the queue is drained or paused past its grace period.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Spawn loop starting on queue '{}' (timestep {:.1}s)",
            self.queue.name(),
            self.timestep
        );
        let mut interval = tokio::time::interval(Duration::from_secs_f64(self.timestep));
        loop {
            interval.tick().await;
            let report = self.tick().await?;
            if report.stop {
                break;
            }
        }

        let counts = self.queue.counts().await?;
        info!(
            "Spawn loop on queue '{}' exiting: {}",
            self.queue.name(),
            format_counts(&counts)
        );
        Ok(())
    }

    /// One pass: sweep, scan, launch.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();

        self.refresh_slots().await?;

        // Reclassify RUNNING tasks whose worker stopped heartbeating, with
        // the disposition of the provider that owned them.
        for (tm_hash, slot) in &mut self.slots {
            let swept = self
                .queue
                .sweep_stale(
                    slot.config.scheduler.heartbeat_timeout_seconds,
                    slot.provider.stale_task_state(),
                    Some(tm_hash),
                )
                .await?;
            report.swept += swept.len();
        }

        // Promote ready tasks and cascade failures.
        let scan = self.queue.scan_ready().await?;
        report.promoted = scan.promoted.len();
        report.cascaded = scan.failed.len();

        match self.queue.state().await? {
            QueueState::Paused => {
                let since = *self.paused_since.get_or_insert_with(Instant::now);
                let mut live = 0;
                for slot in self.slots.values_mut() {
                    live += slot.provider.live_workers().await?;
                }
                let grace = self.idle_grace();
                if live == 0 && (Instant::now() - since).as_secs_f64() >= grace {
                    info!(
                        "Queue '{}' paused for more than {:.0}s with no workers, stopping",
                        self.queue.name(),
                        grace
                    );
                    report.stop = true;
                }
                return Ok(report);
            }
            QueueState::Active => {
                self.paused_since = None;
            }
        }

        // Top up workers per manager configuration.
        let groups = self.queue.groups_by_manager(TaskState::Pending).await?;
        for group in &groups {
            let Some(slot) = self.slots.get_mut(&group.tm_hash) else {
                continue;
            };
            let live = slot.provider.live_workers().await?;
            let target = (group.count as usize).min(slot.config.scheduler.max_workers);
            if target > live {
                let launch = WorkerLaunch {
                    queue_path: self.queue.path(),
                    tm_hash: group.tm_hash.clone(),
                    environment: slot.config.environment.clone(),
                };
                let launched = slot.provider.launch(target - live, &launch).await?;
                report.launched += launched;
            }
        }

        // Exit once nothing is waiting, eligible or in flight.
        let counts = self.queue.counts().await?;
        let active: i64 = [TaskState::Waiting, TaskState::Pending, TaskState::Running]
            .iter()
            .filter_map(|state| counts.get(state))
            .sum();
        if active == 0 {
            debug!("Queue '{}' drained: {}", self.queue.name(), format_counts(&counts));
            report.stop = true;
        }

        Ok(report)
    }

    /// Make sure every manager configuration observed among runnable tasks
    /// has a provider slot.
    async fn refresh_slots(&mut self) -> Result<()> {
        for state in [TaskState::Running, TaskState::Pending, TaskState::Waiting] {
            for group in self.queue.groups_by_manager(state).await? {
                if self.slots.contains_key(&group.tm_hash) {
                    continue;
                }
                let config = match TaskManagerConfig::from_blob(&group.tm_config) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(
                            "Skipping manager group {}: unreadable tm_config: {}",
                            group.tm_hash, e
                        );
                        continue;
                    }
                };
                let provider = Provider::from_spec(&config.provider);
                self.slots.insert(
                    group.tm_hash.clone(),
                    ManagerSlot { config, provider },
                );
            }
        }
        Ok(())
    }

    /// Longest grace period among observed managers; default when none.
    fn idle_grace(&self) -> f64 {
        self.slots
            .values()
            .map(|slot| slot.config.scheduler.idle_grace_seconds)
            .reduce(f64::max)
            .unwrap_or_else(defaults::default_idle_grace)
    }

    /// Terminate all workers of all known providers.
    pub async fn kill_workers(&mut self) -> Result<usize> {
        let mut killed = 0;
        for slot in self.slots.values_mut() {
            killed += slot.provider.kill_workers().await?;
        }
        Ok(killed)
    }
}

/// Re-launch this executable as a detached background scheduler for `queue`,
/// returning the child pid. The child inherits the environment, including
/// `DESIPIPE_QUEUE_DIR`.
pub fn spawn_detached(queue_name: &str, base_dir: Option<&Path>, timestep: f64) -> Result<u32> {
    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("spawn")
        .arg("-q")
        .arg(queue_name)
        .arg("--timestep")
        .arg(timestep.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(base_dir) = base_dir {
        command.env(crate::queue::QUEUE_DIR_ENV, base_dir);
    }
    let child = command.spawn()?;
    let pid = child.id();
    info!("Detached spawn loop for queue '{}' as pid {}", queue_name, pid);
    Ok(pid)
}
