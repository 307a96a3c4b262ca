//! Queue handles and on-disk layout
//!
//! A queue is a named SQLite file under a base directory,
//! `<base_dir>/<name>.sqlite`. A [`Queue`] is a cheap cloneable handle over
//! that file; two handles to the same file, in the same process or not,
//! coordinate only through the store. There is no process-wide queue
//! registry.

use anyhow::{Context, Result};
use shared::{defaults, utils, TaskState};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::database::{
    ClaimFilter, ManagerGroup, QueueState, QueueStore, RetryReport, ScanReport,
};
use crate::task::{Task, TaskOutcome};

/// File extension of queue stores.
const QUEUE_FILE_EXT: &str = "sqlite";

/// Environment variable overriding the default queue base directory.
pub const QUEUE_DIR_ENV: &str = "DESIPIPE_QUEUE_DIR";

/// Resolve the queue base directory: `$DESIPIPE_QUEUE_DIR` if set, otherwise
/// `$HOME/.desipipe/queues/$USER`.
pub fn default_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(QUEUE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".desipipe")
        .join("queues")
        .join(utils::current_user())
}

/// Handle over one queue file.
#[derive(Clone)]
pub struct Queue {
    name: String,
    base_dir: PathBuf,
    store: Arc<RwLock<QueueStore>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

impl Queue {
    /// Open a queue by name, creating the file and schema if needed.
    pub fn new(name: &str, base_dir: Option<&Path>) -> Result<Self> {
        utils::validate_queue_name(name)?;
        let base_dir = base_dir.map(Path::to_path_buf).unwrap_or_else(default_base_dir);
        let path = file_path(&base_dir, name);

        let created = !path.exists();
        let mut store = QueueStore::new(&path, defaults::default_busy_timeout())?;
        store.initialize()?;
        if created {
            info!("Created queue '{}' at {}", name, path.display());
        } else {
            debug!("Opened queue '{}' at {}", name, path.display());
        }

        Ok(Self {
            name: name.to_string(),
            base_dir,
            store: Arc::new(RwLock::new(store)),
        })
    }

    /// Open a queue by name, failing if it does not exist on disk.
    pub fn open(name: &str, base_dir: Option<&Path>) -> Result<Self> {
        let dir = base_dir.map(Path::to_path_buf).unwrap_or_else(default_base_dir);
        let path = file_path(&dir, name);
        if !path.exists() {
            return Err(anyhow::anyhow!("Queue '{}' not found at {}", name, path.display()));
        }
        Self::new(name, Some(&dir))
    }

    /// Open a queue from a full file path; used by workers which are handed
    /// the path rather than a name.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid queue path: {}", path.display()))?
            .to_string();
        let base_dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Invalid queue path: {}", path.display()))?
            .to_path_buf();
        Self::new(&name, Some(&base_dir))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path(&self) -> PathBuf {
        file_path(&self.base_dir, &self.name)
    }

    // ========== Store operations ==========

    pub async fn insert_task(&self, task: &Task) -> Result<Option<TaskState>> {
        self.store.write().await.insert_task(task)
    }

    pub async fn task(&self, id: &str) -> Result<Option<Task>> {
        self.store.write().await.get_task(id)
    }

    pub async fn task_exists(&self, id: &str) -> Result<bool> {
        self.store.write().await.task_exists(id)
    }

    /// Number of tasks in the queue.
    pub async fn size(&self) -> Result<i64> {
        self.store.write().await.task_count()
    }

    pub async fn claim(&self, filter: &ClaimFilter, jobid: &str) -> Result<Option<Task>> {
        self.store
            .write()
            .await
            .claim_next(filter, jobid, utils::current_timestamp())
    }

    pub async fn heartbeat(&self, id: &str, out: Option<&str>, err: Option<&str>) -> Result<()> {
        self.store
            .write()
            .await
            .heartbeat(id, out, err, utils::current_timestamp())
    }

    pub async fn finish(&self, id: &str, outcome: &TaskOutcome) -> Result<()> {
        self.store
            .write()
            .await
            .finish(id, outcome, utils::current_timestamp())
    }

    pub async fn scan_ready(&self) -> Result<ScanReport> {
        self.store
            .write()
            .await
            .scan_ready(utils::current_timestamp())
    }

    pub async fn cascade_failure(&self, id: &str) -> Result<Vec<String>> {
        self.store
            .write()
            .await
            .cascade_failure(id, utils::current_timestamp())
    }

    pub async fn sweep_stale(
        &self,
        heartbeat_timeout: f64,
        stale_state: TaskState,
        tm_hash: Option<&str>,
    ) -> Result<Vec<String>> {
        self.store.write().await.sweep_stale(
            utils::current_timestamp(),
            heartbeat_timeout,
            stale_state,
            tm_hash,
        )
    }

    pub async fn retry(&self, states: &[TaskState]) -> Result<RetryReport> {
        self.store.write().await.retry(states)
    }

    pub async fn kill_all(&self) -> Result<usize> {
        self.store
            .write()
            .await
            .kill_all(utils::current_timestamp())
    }

    pub async fn counts(&self) -> Result<BTreeMap<TaskState, i64>> {
        self.store.write().await.counts_by_state()
    }

    pub async fn tasks(&self, state: Option<TaskState>) -> Result<Vec<Task>> {
        self.store.write().await.select_tasks(state)
    }

    pub async fn find_reusable(
        &self,
        app_name: &str,
        args: &[u8],
        kwargs: &[u8],
        state: Option<TaskState>,
    ) -> Result<Option<Task>> {
        self.store
            .write()
            .await
            .find_reusable(app_name, args, kwargs, state)
    }

    pub async fn groups_by_manager(&self, state: TaskState) -> Result<Vec<ManagerGroup>> {
        self.store.write().await.groups_by_manager(state)
    }

    // ========== Queue state ==========

    pub async fn state(&self) -> Result<QueueState> {
        self.store.write().await.queue_state()
    }

    /// Pause the queue: claims stop, in-flight tasks continue.
    pub async fn pause(&self) -> Result<()> {
        self.store.write().await.set_queue_state(QueueState::Paused)
    }

    pub async fn resume(&self) -> Result<()> {
        self.store.write().await.set_queue_state(QueueState::Active)
    }

    /// Delete the queue file and its WAL siblings.
    pub async fn delete(self) -> Result<()> {
        let path = self.path();
        self.store.write().await.close();
        remove_queue_files(&path)
    }
}

fn file_path(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(format!("{}.{}", name, QUEUE_FILE_EXT))
}

fn remove_queue_files(path: &Path) -> Result<()> {
    std::fs::remove_file(path)
        .with_context(|| format!("Failed to delete queue file {}", path.display()))?;
    // WAL mode leaves -wal/-shm companions next to the database file.
    for suffix in ["-wal", "-shm"] {
        let companion = PathBuf::from(format!("{}{}", path.display(), suffix));
        if companion.exists() {
            if let Err(e) = std::fs::remove_file(&companion) {
                warn!("Failed to delete {}: {}", companion.display(), e);
            }
        }
    }
    info!("Deleted queue {}", path.display());
    Ok(())
}

/// List queue names under `base_dir` matching a glob pattern (no extension).
pub fn list_queues(pattern: &str, base_dir: Option<&Path>) -> Result<Vec<String>> {
    let base_dir = base_dir.map(Path::to_path_buf).unwrap_or_else(default_base_dir);
    if !base_dir.exists() {
        return Ok(Vec::new());
    }

    let glob_pattern = format!(
        "{}/{}.{}",
        base_dir.display(),
        pattern,
        QUEUE_FILE_EXT
    );
    let mut names = Vec::new();
    for entry in glob::glob(&glob_pattern).context("Invalid queue glob pattern")? {
        let path = entry?;
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}
