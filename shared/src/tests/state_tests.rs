//! Tests for the task state lattice

use crate::state::{errno, TaskState};

#[test]
fn test_state_round_trip() {
    for state in TaskState::ALL {
        assert_eq!(TaskState::from_str(state.as_str()).unwrap(), state);
    }
    assert!(TaskState::from_str("SLEEPING").is_err());
}

#[test]
fn test_forward_lattice() {
    assert!(TaskState::Waiting.can_transition(TaskState::Pending));
    assert!(TaskState::Pending.can_transition(TaskState::Running));
    assert!(TaskState::Running.can_transition(TaskState::Succeeded));
    assert!(TaskState::Running.can_transition(TaskState::Failed));
    assert!(TaskState::Running.can_transition(TaskState::Unknown));
    // Walltime requeue for idempotent workloads
    assert!(TaskState::Running.can_transition(TaskState::Pending));
}

#[test]
fn test_cascade_transitions() {
    // A waiting or pending task fails when a dependency fails
    assert!(TaskState::Waiting.can_transition(TaskState::Failed));
    assert!(TaskState::Pending.can_transition(TaskState::Failed));
}

#[test]
fn test_forbidden_transitions() {
    assert!(!TaskState::Waiting.can_transition(TaskState::Running));
    assert!(!TaskState::Waiting.can_transition(TaskState::Succeeded));
    assert!(!TaskState::Pending.can_transition(TaskState::Succeeded));
    assert!(!TaskState::Succeeded.can_transition(TaskState::Running));
    assert!(!TaskState::Succeeded.can_transition(TaskState::Failed));
    assert!(!TaskState::Failed.can_transition(TaskState::Succeeded));
}

#[test]
fn test_retry_transitions() {
    for state in [
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Killed,
        TaskState::Unknown,
    ] {
        assert!(state.can_transition(TaskState::Pending));
        assert!(state.can_transition(TaskState::Waiting));
    }
}

#[test]
fn test_kill_from_anywhere() {
    for state in TaskState::ALL {
        if state == TaskState::Killed {
            assert!(!state.can_transition(TaskState::Killed));
        } else {
            assert!(state.can_transition(TaskState::Killed));
        }
    }
}

#[test]
fn test_terminal_states() {
    assert!(TaskState::Succeeded.is_terminal());
    assert!(TaskState::Failed.is_terminal());
    assert!(TaskState::Killed.is_terminal());
    assert!(!TaskState::Unknown.is_terminal());
    assert!(!TaskState::Running.is_terminal());

    assert!(TaskState::Failed.is_failed());
    assert!(TaskState::Killed.is_failed());
    assert!(!TaskState::Succeeded.is_failed());
}

#[test]
fn test_errno_constants() {
    assert_eq!(errno::OK, 0);
    // Reserved values must never collide with subprocess exit codes
    assert!(errno::DEPENDENCY_FAILED < 0);
    assert!(errno::KILLED < 0);
    assert_ne!(errno::DEPENDENCY_FAILED, errno::KILLED);
}
