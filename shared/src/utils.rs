//! Utility functions for the task scheduler
//!
//! Small helpers shared by the library API, the scheduler and the workers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in seconds, with sub-second precision.
///
/// Task timestamps (`t_created`, `t_started`, `t_finished`, `t_heartbeat`)
/// are stored as REAL columns, so fractional seconds are preserved.
pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Name of the current user, used for the default queue directory.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Truncate string to maximum length (in bytes) with ellipsis
///
/// Truncated failure messages regularly contain non-ASCII (paths, user
/// error strings), so the cut is moved down to the nearest char boundary
/// instead of slicing blindly.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let mut cut = max_len - 3;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &s[..cut])
    }
}

/// Validate a queue name: alphanumeric plus hyphens and underscores, so the
/// name maps directly onto a file name without escaping.
pub fn validate_queue_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::PipelineError::Validation("Queue name cannot be empty".to_string()).into());
    }

    if name.len() > 64 {
        return Err(crate::PipelineError::Validation(
            "Queue name cannot be longer than 64 characters".to_string(),
        )
        .into());
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::PipelineError::Validation(
            "Queue name can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        )
        .into());
    }

    Ok(())
}
