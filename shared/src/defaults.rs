//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

/// Default maximum number of concurrent workers per manager (1 worker)
pub fn default_max_workers() -> usize {
    1
}

/// Default scheduler scan interval (2 seconds)
pub fn default_timestep() -> f64 {
    2.0
}

/// Default heartbeat timeout before a RUNNING task is considered lost (30 seconds)
pub fn default_heartbeat_timeout() -> f64 {
    30.0
}

/// Default interval between worker heartbeats (5 seconds)
pub fn default_heartbeat_interval() -> f64 {
    5.0
}

/// Default time a worker waits on an empty claim before exiting (60 seconds)
pub fn default_worker_idle_timeout() -> f64 {
    60.0
}

/// Default time a paused scheduler lingers before exiting (30 seconds)
pub fn default_idle_grace() -> f64 {
    30.0
}

/// Minimum future polling interval (200 milliseconds)
pub fn default_poll_min() -> f64 {
    0.2
}

/// Maximum future polling interval (2 seconds)
pub fn default_poll_max() -> f64 {
    2.0
}

/// Default Slurm walltime limit, in sbatch `-t` format (30 minutes)
pub fn default_slurm_time_limit() -> String {
    "00:30:00".to_string()
}

/// Default SQLite busy timeout (5 seconds)
pub fn default_busy_timeout() -> u64 {
    5
}
