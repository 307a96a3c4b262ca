//! Test modules for the desipipe crate

mod queue_tests;
mod worker_tests;

use crate::manager::TaskManager;
use crate::queue::Queue;
use crate::task::{AppKind, Task};
use crate::worker::Worker;
use shared::{codec, hashing, TaskManagerConfig};
use tempfile::TempDir;

/// Fresh queue in a temporary directory. The TempDir guard must outlive the
/// queue handle.
pub(crate) fn temp_queue(name: &str) -> (TempDir, Queue) {
    let dir = TempDir::new().unwrap();
    let queue = Queue::new(name, Some(dir.path())).unwrap();
    (dir, queue)
}

/// Manager with the default configuration on the given queue.
pub(crate) fn temp_manager(queue: &Queue) -> TaskManager {
    TaskManager::new(queue.clone(), TaskManagerConfig::default()).unwrap()
}

/// Hand-built task row for store-level tests, bypassing the manager.
pub(crate) fn make_task(app_name: &str, seed: u64, deps: Vec<String>) -> Task {
    let config = TaskManagerConfig::default();
    let args = codec::encode_args(&[serde_json::json!(seed)]).unwrap();
    let kwargs = codec::encode_kwargs(&Default::default()).unwrap();
    let app_hash = hashing::app_hash("noop", "1");
    let mut id_args = args.clone();
    // Dependencies change identity through the arguments in real
    // submissions; fold them in here so hand-built rows stay unique.
    for dep in &deps {
        id_args.extend_from_slice(dep.as_bytes());
    }
    let id = hashing::task_id(app_name, &app_hash, &id_args, &kwargs);
    Task::new(
        id,
        app_name.to_string(),
        app_hash,
        "noop".to_string(),
        AppKind::Func,
        args,
        kwargs,
        deps,
        config.to_blob().unwrap(),
        config.digest().unwrap(),
    )
}

/// Run the worker until the queue holds no runnable task, interleaving
/// readiness scans so promoted dependents are picked up.
pub(crate) async fn drain(queue: &Queue, worker: &Worker) {
    for _ in 0..1000 {
        queue.scan_ready().await.unwrap();
        if worker.run_once().await.unwrap() {
            continue;
        }
        let counts = queue.counts().await.unwrap();
        let runnable = counts
            .get(&shared::TaskState::Waiting)
            .copied()
            .unwrap_or(0)
            + counts
                .get(&shared::TaskState::Pending)
                .copied()
                .unwrap_or(0);
        if runnable == 0 {
            break;
        }
    }
}
