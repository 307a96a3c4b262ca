//! Task table operations
//!
//! All mutations run inside short transactions and respect the task state
//! lattice; a transition outside the lattice is refused with
//! `PipelineError::InvalidTransition`. Claiming uses an IMMEDIATE
//! transaction, so at most one claimant ever moves a given task to RUNNING.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use shared::state::errno;
use shared::{PipelineError, TaskState};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::task::{AppKind, Task, TaskOutcome};

use super::db_meta::{self, QueueState};

/// Columns selected whenever a full task row is loaded.
const TASK_COLUMNS: &str = "id, app_name, app_hash, source, kind, args, kwargs, deps, \
     state, result, errno, out, err, jobid, tm_config, tm_hash, \
     t_created, t_started, t_finished, t_heartbeat";

/// Filter for claiming one pending task.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    /// Restrict to tasks of one manager configuration.
    pub tm_hash: Option<String>,
    /// When set, func tasks are only claimed if their app name is listed;
    /// bash tasks are always claimable because any worker can execute a
    /// rendered command template.
    pub known_apps: Option<Vec<String>>,
}

/// Result of one readiness scan.
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    /// WAITING tasks promoted to PENDING.
    pub promoted: Vec<String>,
    /// Tasks failed because a transitive dependency failed.
    pub failed: Vec<String>,
}

/// Result of a bulk retry.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryReport {
    pub retried: usize,
    /// RUNNING rows matching the filter are left alone.
    pub skipped_running: usize,
}

/// One manager configuration observed among tasks in a given state.
#[derive(Debug, Clone)]
pub struct ManagerGroup {
    pub tm_hash: String,
    pub tm_config: Vec<u8>,
    pub count: i64,
}

/// Create the tasks table and its indexes.
pub fn create_tasks_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,

            -- App identity
            app_name TEXT NOT NULL,
            app_hash TEXT NOT NULL,
            source TEXT NOT NULL,
            kind TEXT NOT NULL,

            -- Inputs and dependency edges
            args BLOB NOT NULL,
            kwargs BLOB NOT NULL,
            deps TEXT NOT NULL,

            -- Execution state
            state TEXT NOT NULL,
            result BLOB,
            errno INTEGER NOT NULL DEFAULT 0,
            out TEXT NOT NULL DEFAULT '',
            err TEXT NOT NULL DEFAULT '',
            jobid TEXT,

            -- Owning manager configuration
            tm_config BLOB NOT NULL,
            tm_hash TEXT NOT NULL,

            -- Timestamps (unix seconds)
            t_created REAL NOT NULL,
            t_started REAL,
            t_finished REAL,
            t_heartbeat REAL
        )
        "#,
        [],
    )
    .context("Failed to create tasks table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_app_state ON tasks(app_name, state)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_tm_state ON tasks(tm_hash, state)",
        [],
    )?;

    Ok(())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let kind: String = row.get(4)?;
    let state: String = row.get(8)?;
    let deps: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        app_name: row.get(1)?,
        app_hash: row.get(2)?,
        source: row.get(3)?,
        kind: AppKind::from_str(&kind).unwrap_or(AppKind::Func),
        args: row.get(5)?,
        kwargs: row.get(6)?,
        deps: serde_json::from_str(&deps).unwrap_or_default(),
        state: TaskState::from_str(&state).unwrap_or(TaskState::Unknown),
        result: row.get(9)?,
        errno: row.get(10)?,
        out: row.get(11)?,
        err: row.get(12)?,
        jobid: row.get(13)?,
        tm_config: row.get(14)?,
        tm_hash: row.get(15)?,
        t_created: row.get(16)?,
        t_started: row.get(17)?,
        t_finished: row.get(18)?,
        t_heartbeat: row.get(19)?,
    })
}

pub fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    conn.query_row(&sql, params![id], row_to_task)
        .optional()
        .with_context(|| format!("Failed to load task {}", id))
}

pub fn task_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

pub fn task_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
}

/// Whether `target` is reachable from any of `roots` through dependency
/// edges already in the store. Used to refuse cyclic inserts.
fn reaches(conn: &Connection, roots: &[String], target: &str) -> Result<bool> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut frontier: VecDeque<String> = roots.iter().cloned().collect();

    while let Some(id) = frontier.pop_front() {
        if id == target {
            return Ok(true);
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        let deps: Option<String> = conn
            .query_row("SELECT deps FROM tasks WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        if let Some(deps) = deps {
            let deps: Vec<String> = serde_json::from_str(&deps).unwrap_or_default();
            frontier.extend(deps);
        }
    }
    Ok(false)
}

/// Insert or update a task by id.
///
/// Dependencies must already exist in the queue, and the row must not reach
/// its own id through them. When a row already exists, the state change must
/// be allowed by the lattice. Returns the prior state if the row existed.
pub fn insert_task(conn: &mut Connection, task: &Task) -> Result<Option<TaskState>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for dep in &task.deps {
        if !task_exists(&tx, dep)? {
            return Err(PipelineError::Validation(format!(
                "dependency {} of task {} is not in the queue",
                dep, task.id
            ))
            .into());
        }
    }
    if reaches(&tx, &task.deps, &task.id)? {
        return Err(PipelineError::InvalidGraph(format!(
            "task {} would depend on itself",
            task.id
        ))
        .into());
    }

    let prev: Option<String> = tx
        .query_row(
            "SELECT state FROM tasks WHERE id = ?1",
            params![task.id],
            |row| row.get(0),
        )
        .optional()?;
    let prev = prev.map(|s| TaskState::from_str(&s)).transpose()?;

    if let Some(prev_state) = prev {
        if prev_state != task.state && !prev_state.can_transition(task.state) {
            return Err(PipelineError::InvalidTransition {
                from: prev_state,
                to: task.state,
            }
            .into());
        }
    }

    let deps_json = serde_json::to_string(&task.deps)?;
    tx.execute(
        r#"
        INSERT INTO tasks (
            id, app_name, app_hash, source, kind, args, kwargs, deps,
            state, result, errno, out, err, jobid, tm_config, tm_hash,
            t_created, t_started, t_finished, t_heartbeat
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
        ON CONFLICT(id) DO UPDATE SET
            app_name = excluded.app_name,
            app_hash = excluded.app_hash,
            source = excluded.source,
            kind = excluded.kind,
            args = excluded.args,
            kwargs = excluded.kwargs,
            deps = excluded.deps,
            state = excluded.state,
            result = excluded.result,
            errno = excluded.errno,
            out = excluded.out,
            err = excluded.err,
            jobid = excluded.jobid,
            tm_config = excluded.tm_config,
            tm_hash = excluded.tm_hash,
            t_created = excluded.t_created,
            t_started = excluded.t_started,
            t_finished = excluded.t_finished,
            t_heartbeat = excluded.t_heartbeat
        "#,
        params![
            task.id,
            task.app_name,
            task.app_hash,
            task.source,
            task.kind.as_str(),
            task.args,
            task.kwargs,
            deps_json,
            task.state.as_str(),
            task.result,
            task.errno,
            task.out,
            task.err,
            task.jobid,
            task.tm_config,
            task.tm_hash,
            task.t_created,
            task.t_started,
            task.t_finished,
            task.t_heartbeat,
        ],
    )
    .with_context(|| format!("Failed to upsert task {}", task.id))?;

    tx.commit()?;
    Ok(prev)
}

/// Atomically claim one PENDING task matching the filter.
///
/// Stamps `jobid`, `t_started` and `t_heartbeat` and moves the row to
/// RUNNING. Returns None when the queue is paused or nothing is eligible.
/// Eligible tasks are taken FIFO by `t_created`, ties broken by id.
pub fn claim_next(
    conn: &mut Connection,
    filter: &ClaimFilter,
    jobid: &str,
    now: f64,
) -> Result<Option<Task>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if db_meta::get_queue_state(&tx)? == QueueState::Paused {
        return Ok(None);
    }

    let mut sql = String::from("SELECT id FROM tasks WHERE state = 'PENDING'");
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(tm_hash) = &filter.tm_hash {
        values.push(Box::new(tm_hash.clone()));
        sql.push_str(&format!(" AND tm_hash = ?{}", values.len()));
    }
    if let Some(known) = &filter.known_apps {
        let placeholders: Vec<String> = known
            .iter()
            .map(|name| {
                values.push(Box::new(name.clone()));
                format!("?{}", values.len())
            })
            .collect();
        if placeholders.is_empty() {
            sql.push_str(" AND kind = 'bash'");
        } else {
            sql.push_str(&format!(
                " AND (kind = 'bash' OR app_name IN ({}))",
                placeholders.join(",")
            ));
        }
    }
    sql.push_str(" ORDER BY t_created ASC, id ASC LIMIT 1");

    let candidate: Option<String> = tx
        .query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))
        .optional()?;

    let Some(id) = candidate else {
        return Ok(None);
    };

    let changed = tx.execute(
        "UPDATE tasks
         SET state = 'RUNNING', jobid = ?1, t_started = ?2, t_heartbeat = ?2
         WHERE id = ?3 AND state = 'PENDING'",
        params![jobid, now, id],
    )?;
    if changed != 1 {
        // Lost the row between SELECT and UPDATE; treat as nothing eligible.
        return Ok(None);
    }

    let task = get_task(&tx, &id)?;
    tx.commit()?;
    debug!("Claimed task {} for job {}", id, jobid);
    Ok(task)
}

/// Advance a RUNNING task's heartbeat, optionally flushing captured output.
///
/// Fails if the task is not RUNNING; the conditional update also guarantees
/// a finalized row is never clobbered by a late flush.
pub fn heartbeat(
    conn: &Connection,
    id: &str,
    out: Option<&str>,
    err: Option<&str>,
    now: f64,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE tasks
         SET t_heartbeat = ?1, out = COALESCE(?2, out), err = COALESCE(?3, err)
         WHERE id = ?4 AND state = 'RUNNING'",
        params![now, out, err, id],
    )?;
    if changed == 0 {
        return Err(anyhow::anyhow!("Task {} is not RUNNING; heartbeat refused", id));
    }
    Ok(())
}

/// Record the final outcome of a RUNNING task.
pub fn finish(conn: &mut Connection, id: &str, outcome: &TaskOutcome, now: f64) -> Result<()> {
    if !matches!(outcome.state, TaskState::Succeeded | TaskState::Failed) {
        return Err(PipelineError::Validation(format!(
            "finish only accepts SUCCEEDED or FAILED, got {}",
            outcome.state
        ))
        .into());
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current: Option<String> = tx
        .query_row("SELECT state FROM tasks WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    let current = match current {
        Some(state) => TaskState::from_str(&state)?,
        None => {
            return Err(PipelineError::QueueCorruption(format!(
                "cannot finish unknown task {}",
                id
            ))
            .into())
        }
    };
    if current != TaskState::Running {
        return Err(PipelineError::InvalidTransition {
            from: current,
            to: outcome.state,
        }
        .into());
    }

    tx.execute(
        "UPDATE tasks
         SET state = ?1, result = ?2, errno = ?3, out = ?4, err = ?5,
             t_finished = ?6, t_heartbeat = ?6
         WHERE id = ?7",
        params![
            outcome.state.as_str(),
            outcome.result,
            outcome.errno,
            outcome.out,
            outcome.err,
            now,
            id
        ],
    )?;

    tx.commit()?;
    debug!("Task {} finished as {}", id, outcome.state);
    Ok(())
}

struct GraphRow {
    id: String,
    state: TaskState,
    deps: Vec<String>,
}

fn load_graph(conn: &Connection) -> Result<Vec<GraphRow>> {
    let mut stmt = conn.prepare("SELECT id, state, deps FROM tasks")?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let state: String = row.get(1)?;
        let deps: String = row.get(2)?;
        Ok((id, state, deps))
    })?;

    let mut graph = Vec::new();
    for row in rows {
        let (id, state, deps) = row?;
        graph.push(GraphRow {
            id,
            state: TaskState::from_str(&state)?,
            deps: serde_json::from_str(&deps).unwrap_or_default(),
        });
    }
    Ok(graph)
}

/// Propagate dependency readiness and failure to a fixpoint.
///
/// Runs over an in-memory snapshot of `(id, state, deps)` inside one
/// transaction: WAITING tasks whose deps are all SUCCEEDED are promoted to
/// PENDING; WAITING or PENDING tasks with a terminally failed dependency are
/// failed with `errno::DEPENDENCY_FAILED`, and that failure cascades in the
/// same pass. A dependency missing from the queue is fatal corruption.
pub fn scan_ready(conn: &mut Connection, now: f64) -> Result<ScanReport> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let graph = load_graph(&tx)?;

    let mut states: HashMap<&str, TaskState> = graph
        .iter()
        .map(|row| (row.id.as_str(), row.state))
        .collect();
    let mut report = ScanReport::default();

    loop {
        let mut changed = false;
        for row in &graph {
            let current = states[row.id.as_str()];
            if !matches!(current, TaskState::Waiting | TaskState::Pending) {
                continue;
            }

            let mut any_failed = false;
            let mut all_succeeded = true;
            for dep in &row.deps {
                match states.get(dep.as_str()) {
                    None => {
                        return Err(PipelineError::QueueCorruption(format!(
                            "task {} depends on {} which is not in the queue",
                            row.id, dep
                        ))
                        .into());
                    }
                    Some(state) if state.is_failed() => {
                        any_failed = true;
                        break;
                    }
                    Some(TaskState::Succeeded) => {}
                    Some(_) => all_succeeded = false,
                }
            }

            if any_failed {
                states.insert(row.id.as_str(), TaskState::Failed);
                report.failed.push(row.id.clone());
                changed = true;
            } else if all_succeeded && current == TaskState::Waiting {
                states.insert(row.id.as_str(), TaskState::Pending);
                report.promoted.push(row.id.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for id in &report.promoted {
        tx.execute(
            "UPDATE tasks SET state = 'PENDING' WHERE id = ?1 AND state = 'WAITING'",
            params![id],
        )?;
    }
    for id in &report.failed {
        tx.execute(
            "UPDATE tasks
             SET state = 'FAILED', errno = ?1, err = ?2, t_finished = ?3
             WHERE id = ?4 AND state IN ('WAITING', 'PENDING')",
            params![
                errno::DEPENDENCY_FAILED,
                "dependency failed",
                now,
                id
            ],
        )?;
    }

    tx.commit()?;
    if !report.promoted.is_empty() || !report.failed.is_empty() {
        debug!(
            "Readiness scan: {} promoted, {} failed by cascade",
            report.promoted.len(),
            report.failed.len()
        );
    }
    Ok(report)
}

/// Fail every transitive dependent of `id` that has not finished yet.
pub fn cascade_failure(conn: &mut Connection, id: &str, now: f64) -> Result<Vec<String>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let graph = load_graph(&tx)?;

    let mut failed: HashSet<String> = HashSet::new();
    failed.insert(id.to_string());
    let mut marked = Vec::new();

    loop {
        let mut changed = false;
        for row in &graph {
            if failed.contains(&row.id)
                || !matches!(row.state, TaskState::Waiting | TaskState::Pending)
            {
                continue;
            }
            if row.deps.iter().any(|dep| failed.contains(dep)) {
                failed.insert(row.id.clone());
                marked.push(row.id.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for dependent in &marked {
        tx.execute(
            "UPDATE tasks
             SET state = 'FAILED', errno = ?1, err = ?2, t_finished = ?3
             WHERE id = ?4 AND state IN ('WAITING', 'PENDING')",
            params![
                errno::DEPENDENCY_FAILED,
                format!("dependency {} failed", id),
                now,
                dependent
            ],
        )?;
    }

    tx.commit()?;
    Ok(marked)
}

/// Reclassify RUNNING tasks whose heartbeat expired.
///
/// `stale_state` is the provider's disposition: UNKNOWN for lost local
/// workers, KILLED or PENDING for batch walltime expiry.
pub fn sweep_stale(
    conn: &mut Connection,
    now: f64,
    heartbeat_timeout: f64,
    stale_state: TaskState,
    tm_hash: Option<&str>,
) -> Result<Vec<String>> {
    let cutoff = now - heartbeat_timeout;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut sql = String::from(
        "SELECT id FROM tasks
         WHERE state = 'RUNNING' AND COALESCE(t_heartbeat, t_started, 0) < ?1",
    );
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(cutoff)];
    if let Some(tm_hash) = tm_hash {
        values.push(Box::new(tm_hash.to_string()));
        sql.push_str(" AND tm_hash = ?2");
    }

    let stale: Vec<String> = {
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
            row.get::<_, String>(0)
        })?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    for id in &stale {
        match stale_state {
            TaskState::Unknown => {
                tx.execute(
                    "UPDATE tasks SET state = 'UNKNOWN' WHERE id = ?1 AND state = 'RUNNING'",
                    params![id],
                )?;
            }
            TaskState::Pending => {
                tx.execute(
                    "UPDATE tasks
                     SET state = 'PENDING', jobid = NULL, t_started = NULL, t_heartbeat = NULL
                     WHERE id = ?1 AND state = 'RUNNING'",
                    params![id],
                )?;
            }
            TaskState::Killed => {
                tx.execute(
                    "UPDATE tasks
                     SET state = 'KILLED', errno = ?1, t_finished = ?2
                     WHERE id = ?3 AND state = 'RUNNING'",
                    params![errno::KILLED, now, id],
                )?;
            }
            other => {
                return Err(PipelineError::Validation(format!(
                    "sweep cannot move stale tasks to {}",
                    other
                ))
                .into());
            }
        }
        warn!("Task {} lost its heartbeat, moved to {}", id, stale_state);
    }

    tx.commit()?;
    Ok(stale)
}

/// Bulk-transition tasks matching the state filter back to the runnable
/// states, clearing results, captured output and worker assignment.
///
/// Rows with dependencies return to WAITING so the next scan re-checks
/// readiness; dependency-free rows go straight to PENDING. RUNNING rows are
/// never touched: re-queuing a task under a live worker would break the
/// at-most-once claim guarantee.
pub fn retry(conn: &mut Connection, states: &[TaskState]) -> Result<RetryReport> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut report = RetryReport::default();

    for state in states {
        if *state == TaskState::Running {
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM tasks WHERE state = 'RUNNING'",
                [],
                |row| row.get(0),
            )?;
            report.skipped_running += count as usize;
            if count > 0 {
                warn!("Retry of RUNNING tasks is a no-op; {} rows skipped", count);
            }
            continue;
        }

        let rows: Vec<(String, String)> = {
            let mut stmt = tx.prepare("SELECT id, deps FROM tasks WHERE state = ?1")?;
            let mapped = stmt.query_map(params![state.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            mapped.collect::<std::result::Result<_, _>>()?
        };

        for (id, deps) in rows {
            let deps: Vec<String> = serde_json::from_str(&deps).unwrap_or_default();
            let new_state = if deps.is_empty() {
                TaskState::Pending
            } else {
                TaskState::Waiting
            };
            tx.execute(
                "UPDATE tasks
                 SET state = ?1, result = NULL, errno = 0, out = '', err = '',
                     jobid = NULL, t_started = NULL, t_finished = NULL, t_heartbeat = NULL
                 WHERE id = ?2",
                params![new_state.as_str(), id],
            )?;
            report.retried += 1;
        }
    }

    tx.commit()?;
    Ok(report)
}

/// Mark every non-terminal task KILLED. Idempotent: terminal rows are left
/// untouched, so a repeated kill is a no-op.
pub fn kill_all(conn: &mut Connection, now: f64) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let changed = tx.execute(
        "UPDATE tasks
         SET state = 'KILLED', errno = ?1, t_finished = ?2
         WHERE state IN ('WAITING', 'PENDING', 'RUNNING', 'UNKNOWN')",
        params![errno::KILLED, now],
    )?;
    tx.commit()?;
    Ok(changed)
}

/// Task counts per state, for queue listings.
pub fn counts_by_state(conn: &Connection) -> Result<BTreeMap<TaskState, i64>> {
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = BTreeMap::new();
    for row in rows {
        let (state, count) = row?;
        counts.insert(TaskState::from_str(&state)?, count);
    }
    Ok(counts)
}

/// Load tasks, optionally filtered by state, FIFO by creation time.
pub fn select_tasks(conn: &Connection, state: Option<TaskState>) -> Result<Vec<Task>> {
    let mut sql = format!("SELECT {} FROM tasks", TASK_COLUMNS);
    if state.is_some() {
        sql.push_str(" WHERE state = ?1");
    }
    sql.push_str(" ORDER BY t_created ASC, id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let tasks = match state {
        Some(state) => {
            let rows = stmt.query_map(params![state.as_str()], row_to_task)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let rows = stmt.query_map([], row_to_task)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok(tasks)
}

/// Find a prior task with the same app name and argument blobs, for the
/// name-based reuse policy. Source and version are deliberately ignored.
///
/// With an explicit state filter only rows in that state match; without
/// one, any non-failed row matches, mirroring the content-identity reuse
/// default (a FAILED or KILLED prior must re-execute, not be reused).
pub fn find_reusable(
    conn: &Connection,
    app_name: &str,
    args: &[u8],
    kwargs: &[u8],
    state: Option<TaskState>,
) -> Result<Option<Task>> {
    let mut sql = format!(
        "SELECT {} FROM tasks WHERE app_name = ?1 AND args = ?2 AND kwargs = ?3",
        TASK_COLUMNS
    );
    if state.is_some() {
        sql.push_str(" AND state = ?4");
    } else {
        sql.push_str(" AND state NOT IN ('FAILED', 'KILLED')");
    }
    sql.push_str(" ORDER BY t_created ASC LIMIT 1");

    let found = match state {
        Some(state) => conn
            .query_row(
                &sql,
                params![app_name, args, kwargs, state.as_str()],
                row_to_task,
            )
            .optional()?,
        None => conn
            .query_row(&sql, params![app_name, args, kwargs], row_to_task)
            .optional()?,
    };
    Ok(found)
}

/// Manager configurations observed among tasks in `state`, with counts.
pub fn groups_by_manager(conn: &Connection, state: TaskState) -> Result<Vec<ManagerGroup>> {
    let mut stmt = conn.prepare(
        "SELECT tm_hash, tm_config, COUNT(*)
         FROM tasks WHERE state = ?1 GROUP BY tm_hash",
    )?;
    let rows = stmt.query_map(params![state.as_str()], |row| {
        Ok(ManagerGroup {
            tm_hash: row.get(0)?,
            tm_config: row.get(1)?,
            count: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}
