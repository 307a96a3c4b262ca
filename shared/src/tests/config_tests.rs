//! Tests for the TaskManager configuration model

use crate::config::{ProviderSpec, TaskManagerConfig};
use crate::TaskState;

#[test]
fn test_default_config_is_valid() {
    let config = TaskManagerConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.scheduler.max_workers, 1);
    assert!(matches!(config.provider, ProviderSpec::Local { .. }));
}

#[test]
fn test_blob_round_trip() {
    let mut config = TaskManagerConfig::default();
    config.scheduler.max_workers = 4;
    config
        .environment
        .vars
        .insert("OMP_NUM_THREADS".to_string(), "8".to_string());

    let blob = config.to_blob().unwrap();
    assert_eq!(TaskManagerConfig::from_blob(&blob).unwrap(), config);
}

#[test]
fn test_digest_tracks_content() {
    let base = TaskManagerConfig::default();
    let mut changed = base.clone();
    changed.scheduler.max_workers = 16;

    assert_eq!(base.digest().unwrap(), TaskManagerConfig::default().digest().unwrap());
    assert_ne!(base.digest().unwrap(), changed.digest().unwrap());
}

#[test]
fn test_from_toml() {
    let content = r#"
        [environment]
        commands = ["source /etc/profile"]

        [environment.vars]
        OMP_NUM_THREADS = "4"

        [scheduler]
        max_workers = 8

        [provider]
        type = "slurm"
        account = "desi"
        time_limit = "01:00:00"
        killed_at_timeout = true
    "#;

    let config = TaskManagerConfig::from_toml(content).unwrap();
    assert_eq!(config.scheduler.max_workers, 8);
    assert_eq!(
        config.environment.vars.get("OMP_NUM_THREADS"),
        Some(&"4".to_string())
    );
    match &config.provider {
        ProviderSpec::Slurm {
            account,
            killed_at_timeout,
            ..
        } => {
            assert_eq!(account.as_deref(), Some("desi"));
            assert!(killed_at_timeout);
        }
        other => panic!("Expected slurm provider, got {:?}", other),
    }
}

#[test]
fn test_validation_rejects_bad_values() {
    let mut config = TaskManagerConfig::default();
    config.scheduler.max_workers = 0;
    assert!(config.validate().is_err());

    let mut config = TaskManagerConfig::default();
    config.scheduler.timestep_seconds = 0.0;
    assert!(config.validate().is_err());

    let mut config = TaskManagerConfig::default();
    config.scheduler.heartbeat_timeout_seconds = 1.0;
    config.scheduler.heartbeat_interval_seconds = 5.0;
    assert!(config.validate().is_err());
}

#[test]
fn test_stale_task_state_per_provider() {
    let local = ProviderSpec::Local {
        worker_command: Vec::new(),
    };
    assert_eq!(local.stale_task_state(), TaskState::Unknown);

    let slurm_kill = ProviderSpec::Slurm {
        worker_command: Vec::new(),
        account: None,
        partition: None,
        time_limit: "00:30:00".to_string(),
        killed_at_timeout: true,
    };
    assert_eq!(slurm_kill.stale_task_state(), TaskState::Killed);

    let slurm_requeue = ProviderSpec::Slurm {
        worker_command: Vec::new(),
        account: None,
        partition: None,
        time_limit: "00:30:00".to_string(),
        killed_at_timeout: false,
    };
    assert_eq!(slurm_requeue.stale_task_state(), TaskState::Pending);
}
