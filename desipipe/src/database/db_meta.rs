//! Queue metadata table
//!
//! The `meta` key/value table carries the queue state (ACTIVE or PAUSED) and
//! the schema version. Queue state gates worker claims only: a paused queue
//! hands out no new tasks but does not abort in-flight ones.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

/// Schema version written at initialization time.
pub const SCHEMA_VERSION: &str = "1";

const KEY_STATE: &str = "state";
const KEY_VERSION: &str = "version";

/// Operational state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Active,
    Paused,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Active => "ACTIVE",
            QueueState::Paused => "PAUSED",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(QueueState::Active),
            "PAUSED" => Ok(QueueState::Paused),
            _ => Err(anyhow::anyhow!("Invalid queue state: {}", s)),
        }
    }
}

/// Create the meta table and seed defaults for a fresh queue.
pub fn create_meta_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create meta table")?;

    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, ?2)",
        params![KEY_STATE, QueueState::Active.as_str()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, ?2)",
        params![KEY_VERSION, SCHEMA_VERSION],
    )?;

    Ok(())
}

pub fn get_queue_state(conn: &Connection) -> Result<QueueState> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![KEY_STATE],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        Some(value) => QueueState::from_str(&value),
        // A queue without a state row predates initialization; treat as active.
        None => Ok(QueueState::Active),
    }
}

pub fn set_queue_state(conn: &Connection, state: QueueState) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![KEY_STATE, state.as_str()],
    )?;
    info!("Queue state set to {}", state.as_str());
    Ok(())
}

pub fn get_version(conn: &Connection) -> Result<String> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![KEY_VERSION],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or_else(|| SCHEMA_VERSION.to_string()))
}
