//! Tests for queue handles and the on-disk layout

use crate::queue::{list_queues, Queue};
use tempfile::TempDir;

#[tokio::test]
async fn test_open_requires_existing_file() {
    let dir = TempDir::new().unwrap();
    assert!(Queue::open("missing", Some(dir.path())).is_err());

    Queue::new("present", Some(dir.path())).unwrap();
    assert!(Queue::open("present", Some(dir.path())).is_ok());
}

#[test]
fn test_invalid_names_rejected() {
    let dir = TempDir::new().unwrap();
    assert!(Queue::new("", Some(dir.path())).is_err());
    assert!(Queue::new("has space", Some(dir.path())).is_err());
    assert!(Queue::new("has/slash", Some(dir.path())).is_err());
    assert!(Queue::new("fine_name-3", Some(dir.path())).is_ok());
}

#[tokio::test]
async fn test_from_path() {
    let dir = TempDir::new().unwrap();
    let queue = Queue::new("nightly", Some(dir.path())).unwrap();
    let path = queue.path();

    let reopened = Queue::from_path(&path).unwrap();
    assert_eq!(reopened.name(), "nightly");
    assert_eq!(reopened.base_dir(), dir.path());
}

#[test]
fn test_list_queues_glob() {
    let dir = TempDir::new().unwrap();
    Queue::new("nightly_a", Some(dir.path())).unwrap();
    Queue::new("nightly_b", Some(dir.path())).unwrap();
    Queue::new("other", Some(dir.path())).unwrap();

    let names = list_queues("nightly_*", Some(dir.path())).unwrap();
    assert_eq!(names, vec!["nightly_a", "nightly_b"]);

    let all = list_queues("*", Some(dir.path())).unwrap();
    assert_eq!(all.len(), 3);

    let none = list_queues("daily_*", Some(dir.path())).unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_delete_removes_file() {
    let dir = TempDir::new().unwrap();
    let queue = Queue::new("short_lived", Some(dir.path())).unwrap();
    let path = queue.path();
    assert!(path.exists());

    queue.delete().await.unwrap();
    assert!(!path.exists());
    assert!(list_queues("*", Some(dir.path())).unwrap().is_empty());
}

#[tokio::test]
async fn test_two_handles_share_state() {
    let dir = TempDir::new().unwrap();
    let first = Queue::new("shared_q", Some(dir.path())).unwrap();
    let second = Queue::new("shared_q", Some(dir.path())).unwrap();

    first.pause().await.unwrap();
    assert_eq!(
        second.state().await.unwrap(),
        crate::database::QueueState::Paused
    );
    second.resume().await.unwrap();
    assert_eq!(
        first.state().await.unwrap(),
        crate::database::QueueState::Active
    );
}
