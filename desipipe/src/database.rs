//! Queue store backed by a single SQLite file
//!
//! One queue is one database file. All processes touching a queue (the
//! submitting user process, the spawn loop, every worker) coordinate only
//! through this store, so it is opened in WAL mode with a busy timeout: WAL
//! lets readers proceed while a writer commits, and the busy timeout makes
//! concurrent writers wait for the lock instead of failing immediately.

mod db_meta;
mod db_tasks;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::TaskState;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::task::{Task, TaskOutcome};

// Re-export store types for the public API
pub use db_meta::QueueState;
pub use db_tasks::{ClaimFilter, ManagerGroup, RetryReport, ScanReport};

/// SQLite store manager for one queue file.
pub struct QueueStore {
    /// Path to the database file.
    db_path: PathBuf,
    /// The active SQLite connection, opened lazily.
    connection: Option<Connection>,
    /// Database busy timeout in seconds.
    busy_timeout_seconds: u64,
}

impl QueueStore {
    /// Create a store manager for a queue file. The file itself is created
    /// on [`QueueStore::initialize`].
    pub fn new<P: AsRef<Path>>(db_path: P, busy_timeout_seconds: u64) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create queue directory: {}", parent.display())
                })?;
            }
        }

        Ok(Self {
            db_path,
            connection: None,
            busy_timeout_seconds,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Create tables and indexes. Idempotent, safe to call on every open.
    pub fn initialize(&mut self) -> Result<()> {
        debug!("Initializing queue store at {}", self.db_path.display());

        let conn = self.get_connection()?;
        db_tasks::create_tasks_table(conn)?;
        db_meta::create_meta_table(conn)?;

        Ok(())
    }

    /// Lazily get the database connection, configuring WAL mode and the busy
    /// timeout on first open.
    fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open queue: {}", self.db_path.display()))?;

            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            conn.busy_timeout(std::time::Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }

        // `unwrap` is safe here because we've just ensured `self.connection` is `Some`.
        Ok(self.connection.as_mut().unwrap())
    }

    /// Close the database connection gracefully.
    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close() {
                warn!("Error closing queue store: {:?}", e);
            }
        }
    }

    // ========== Task operations ==========

    pub fn insert_task(&mut self, task: &Task) -> Result<Option<TaskState>> {
        let conn = self.get_connection()?;
        db_tasks::insert_task(conn, task)
    }

    pub fn get_task(&mut self, id: &str) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        db_tasks::get_task(conn, id)
    }

    pub fn task_exists(&mut self, id: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        db_tasks::task_exists(conn, id)
    }

    pub fn task_count(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        db_tasks::task_count(conn)
    }

    pub fn claim_next(
        &mut self,
        filter: &ClaimFilter,
        jobid: &str,
        now: f64,
    ) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        db_tasks::claim_next(conn, filter, jobid, now)
    }

    pub fn heartbeat(
        &mut self,
        id: &str,
        out: Option<&str>,
        err: Option<&str>,
        now: f64,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::heartbeat(conn, id, out, err, now)
    }

    pub fn finish(&mut self, id: &str, outcome: &TaskOutcome, now: f64) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::finish(conn, id, outcome, now)
    }

    pub fn scan_ready(&mut self, now: f64) -> Result<ScanReport> {
        let conn = self.get_connection()?;
        db_tasks::scan_ready(conn, now)
    }

    pub fn cascade_failure(&mut self, id: &str, now: f64) -> Result<Vec<String>> {
        let conn = self.get_connection()?;
        db_tasks::cascade_failure(conn, id, now)
    }

    pub fn sweep_stale(
        &mut self,
        now: f64,
        heartbeat_timeout: f64,
        stale_state: TaskState,
        tm_hash: Option<&str>,
    ) -> Result<Vec<String>> {
        let conn = self.get_connection()?;
        db_tasks::sweep_stale(conn, now, heartbeat_timeout, stale_state, tm_hash)
    }

    pub fn retry(&mut self, states: &[TaskState]) -> Result<RetryReport> {
        let conn = self.get_connection()?;
        db_tasks::retry(conn, states)
    }

    pub fn kill_all(&mut self, now: f64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_tasks::kill_all(conn, now)
    }

    pub fn counts_by_state(&mut self) -> Result<BTreeMap<TaskState, i64>> {
        let conn = self.get_connection()?;
        db_tasks::counts_by_state(conn)
    }

    pub fn select_tasks(&mut self, state: Option<TaskState>) -> Result<Vec<Task>> {
        let conn = self.get_connection()?;
        db_tasks::select_tasks(conn, state)
    }

    pub fn find_reusable(
        &mut self,
        app_name: &str,
        args: &[u8],
        kwargs: &[u8],
        state: Option<TaskState>,
    ) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        db_tasks::find_reusable(conn, app_name, args, kwargs, state)
    }

    pub fn groups_by_manager(&mut self, state: TaskState) -> Result<Vec<ManagerGroup>> {
        let conn = self.get_connection()?;
        db_tasks::groups_by_manager(conn, state)
    }

    // ========== Queue state ==========

    pub fn queue_state(&mut self) -> Result<QueueState> {
        let conn = self.get_connection()?;
        db_meta::get_queue_state(conn)
    }

    pub fn set_queue_state(&mut self, state: QueueState) -> Result<()> {
        let conn = self.get_connection()?;
        db_meta::set_queue_state(conn, state)
    }

    pub fn version(&mut self) -> Result<String> {
        let conn = self.get_connection()?;
        db_meta::get_version(conn)
    }
}

impl Drop for QueueStore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Log-friendly one-line summary of per-state counts.
pub fn format_counts(counts: &BTreeMap<TaskState, i64>) -> String {
    if counts.is_empty() {
        return "empty".to_string();
    }
    counts
        .iter()
        .map(|(state, count)| format!("{}={}", state, count))
        .collect::<Vec<_>>()
        .join(" ")
}
