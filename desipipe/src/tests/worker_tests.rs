//! Tests for the worker runtime

use crate::database::ClaimFilter;
use crate::manager::FuncHandler;
use crate::tests::{drain, temp_manager, temp_queue};
use crate::worker::Worker;
use rand::{Rng, SeedableRng};
use serde_json::json;
use shared::{hashing, TaskState};
use std::sync::Arc;

fn worker_for(manager: &crate::manager::TaskManager) -> Worker {
    Worker::new(
        manager.queue().clone(),
        manager.registry(),
        Some(manager.tm_hash().to_string()),
    )
}

#[tokio::test]
async fn test_func_app_succeeds() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let handler: FuncHandler = Arc::new(|ctx, input| {
        ctx.print("doubling");
        let x = input.args[0].as_i64().unwrap();
        Ok(json!(x * 2))
    });
    let app = tm.func_app("double", "x * 2", "1", handler).unwrap();

    let future = app.submit(vec![json!(21)]).await.unwrap();
    let worker = worker_for(&tm);
    assert!(worker.run_once().await.unwrap());

    assert_eq!(future.result().await.unwrap(), json!(42));
    assert_eq!(future.state().await.unwrap(), TaskState::Succeeded);
    assert_eq!(future.out().await.unwrap(), "doubling\n");
}

#[tokio::test]
async fn test_func_app_failure_has_stable_errno() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let handler: FuncHandler = Arc::new(|_ctx, _input| Err(anyhow::anyhow!("boom")));
    let app = tm.func_app("broken", "always fails", "1", handler).unwrap();

    let future = app.submit(vec![json!(1)]).await.unwrap();
    let worker = worker_for(&tm);
    assert!(worker.run_once().await.unwrap());

    let task = queue.task(future.id()).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.errno, hashing::stable_errno("boom"));
    assert!(task.err.contains("boom"));
    assert!(future.result().await.is_err());
}

#[tokio::test]
async fn test_func_app_panic_is_captured() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let handler: FuncHandler = Arc::new(|_ctx, _input| panic!("index out of range"));
    let app = tm.func_app("panicky", "panics", "1", handler).unwrap();

    let future = app.submit(vec![json!(1)]).await.unwrap();
    let worker = worker_for(&tm);
    assert!(worker.run_once().await.unwrap());

    let task = queue.task(future.id()).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.err.contains("index out of range"));
    assert!((1..=125).contains(&task.errno));
}

#[tokio::test]
async fn test_bash_app_captures_stdout() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let app = tm
        .bash_app("greet", &["sh", "-c", "echo hello from bash"], "1")
        .unwrap();

    let future = app.submit(vec![]).await.unwrap();
    let worker = worker_for(&tm);
    assert!(worker.run_once().await.unwrap());

    assert_eq!(future.result().await.unwrap(), json!(0));
    assert!(future.out().await.unwrap().contains("hello from bash"));
}

#[tokio::test]
async fn test_bash_exit_code_becomes_errno() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let app = tm
        .bash_app("partial", &["sh", "-c", "echo partial output; exit 3"], "1")
        .unwrap();

    let future = app.submit(vec![]).await.unwrap();
    let worker = worker_for(&tm);
    assert!(worker.run_once().await.unwrap());

    let task = queue.task(future.id()).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.errno, 3);
    // Output produced before the exit is preserved.
    assert!(task.out.contains("partial output"));
}

#[tokio::test]
async fn test_bash_template_substitution() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let app = tm
        .bash_app("format", &["echo", "value is {0:.4f}"], "1")
        .unwrap();

    let future = app.submit(vec![json!(3.14159265)]).await.unwrap();
    let worker = worker_for(&tm);
    assert!(worker.run_once().await.unwrap());

    assert_eq!(future.out().await.unwrap(), "value is 3.1416\n");
}

#[tokio::test]
async fn test_dependency_materialization() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let double: FuncHandler = Arc::new(|_ctx, input| {
        Ok(json!(input.args[0].as_i64().unwrap() * 2))
    });
    let add: FuncHandler = Arc::new(|_ctx, input| {
        Ok(json!(
            input.args[0].as_i64().unwrap() + input.args[1].as_i64().unwrap()
        ))
    });
    let double_app = tm.func_app("double", "x * 2", "1", double).unwrap();
    let add_app = tm.func_app("add", "a + b", "1", add).unwrap();

    let doubled = double_app.submit(vec![json!(21)]).await.unwrap();
    let sum = add_app
        .submit(vec![doubled.as_value(), json!(8)])
        .await
        .unwrap();

    let worker = worker_for(&tm);
    drain(&queue, &worker).await;

    assert_eq!(sum.result().await.unwrap(), json!(50));
}

#[tokio::test]
async fn test_worker_ignores_unregistered_func_tasks() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let app = tm
        .func_app("private", "user only", "1", Arc::new(|_, _| Ok(json!(1))))
        .unwrap();
    app.submit(vec![json!(1)]).await.unwrap();

    // A stock worker with an empty registry must not claim func tasks.
    let stock = Worker::new(
        queue.clone(),
        Arc::new(std::sync::RwLock::new(crate::manager::AppRegistry::default())),
        None,
    );
    assert!(!stock.run_once().await.unwrap());
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.get(&TaskState::Pending), Some(&1));
}

#[tokio::test]
async fn test_changed_app_source_is_refused() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let v1 = tm
        .func_app("evolving", "v1", "1", Arc::new(|_, _| Ok(json!(1))))
        .unwrap();
    let future = v1.submit(vec![json!(1)]).await.unwrap();

    // Re-register under the same name with different source: the row's
    // app_hash no longer matches the registry.
    tm.func_app("evolving", "v2", "1", Arc::new(|_, _| Ok(json!(2))))
        .unwrap();

    let worker = worker_for(&tm);
    assert!(worker.run_once().await.unwrap());

    let task = queue.task(future.id()).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.err.contains("source changed"));
}

#[tokio::test]
async fn test_finish_race_with_kill_does_not_abort_worker() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);

    // The handler kills its own row mid-execution, as a concurrent
    // `desipipe kill` would, so the worker's finish finds it non-RUNNING.
    let path = queue.path();
    let handler: FuncHandler = Arc::new(move |_ctx, _input| {
        let conn = rusqlite::Connection::open(&path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            "UPDATE tasks SET state = 'KILLED', errno = -9 WHERE state = 'RUNNING'",
            [],
        )?;
        Ok(json!(1))
    });
    let app = tm.func_app("racer", "killed mid-run", "1", handler).unwrap();
    let future = app.submit(vec![json!(1)]).await.unwrap();

    let worker = worker_for(&tm);
    // The dropped result is logged, not an error that aborts the worker.
    assert!(worker.run_once().await.is_ok());
    assert_eq!(future.state().await.unwrap(), TaskState::Killed);
}

#[tokio::test]
async fn test_lost_worker_recovery_flow() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);
    let app = tm
        .func_app("survivor", "returns 1", "1", Arc::new(|_, _| Ok(json!(1))))
        .unwrap();
    let future = app.submit(vec![json!(1)]).await.unwrap();

    // Claim without ever heartbeating, as a SIGKILLed worker would.
    queue.claim(&ClaimFilter::default(), "dead-worker").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let swept = queue
        .sweep_stale(0.01, TaskState::Unknown, None)
        .await
        .unwrap();
    assert_eq!(swept.len(), 1);

    // Explicit retry returns it to the pool; a live worker completes it.
    queue.retry(&[TaskState::Unknown]).await.unwrap();
    let worker = worker_for(&tm);
    assert!(worker.run_once().await.unwrap());
    assert_eq!(future.result().await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_partial_rerun_by_name() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);

    // v1 raises for i >= 2.
    let v1_handler: FuncHandler = Arc::new(|_ctx, input| {
        let i = input.args[0].as_i64().unwrap();
        if i >= 2 {
            Err(anyhow::anyhow!("value {} too large", i))
        } else {
            Ok(json!(i))
        }
    });
    let v1 = tm.func_app("step", "fail for i >= 2", "1", v1_handler).unwrap();
    let mut futures = Vec::new();
    for i in 0..4 {
        futures.push(v1.submit(vec![json!(i)]).await.unwrap());
    }

    let worker = worker_for(&tm);
    drain(&queue, &worker).await;

    let mut states = Vec::new();
    for future in &futures {
        states.push(future.state().await.unwrap());
    }
    assert_eq!(
        states,
        vec![
            TaskState::Succeeded,
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Failed
        ]
    );

    // v2 returns i + 10, reusing prior SUCCEEDED rows by name.
    let v2_handler: FuncHandler =
        Arc::new(|_ctx, input| Ok(json!(input.args[0].as_i64().unwrap() + 10)));
    let v2 = tm
        .func_app("step", "return i + 10", "2", v2_handler)
        .unwrap()
        .reuse_by_name()
        .reuse_state(TaskState::Succeeded);

    let mut rerun = Vec::new();
    for i in 0..4 {
        rerun.push(v2.submit(vec![json!(i)]).await.unwrap());
    }
    drain(&queue, &worker).await;

    let mut results = Vec::new();
    for future in &rerun {
        results.push(future.result().await.unwrap());
    }
    assert_eq!(results, vec![json!(0), json!(1), json!(12), json!(13)]);
}

#[tokio::test]
async fn test_pi_estimation_pipeline() {
    let (_dir, queue) = temp_queue("wrk");
    let tm = temp_manager(&queue);

    // Monte-carlo fraction of points inside the unit quarter circle.
    let fraction_handler: FuncHandler = Arc::new(|_ctx, input| {
        let seed = input.args[0].as_u64().unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let samples = 20_000;
        let mut inside = 0u32;
        for _ in 0..samples {
            let x: f64 = rng.random();
            let y: f64 = rng.random();
            if x * x + y * y < 1.0 {
                inside += 1;
            }
        }
        Ok(json!(4.0 * inside as f64 / samples as f64))
    });
    let average_handler: FuncHandler = Arc::new(|_ctx, input| {
        let values = input.args[0].as_array().unwrap();
        let sum: f64 = values.iter().map(|value| value.as_f64().unwrap()).sum();
        Ok(json!(sum / values.len() as f64))
    });

    let fraction = tm
        .func_app("fraction", "monte carlo pi fraction", "1", fraction_handler)
        .unwrap();
    let average = tm
        .func_app("average", "mean of fractions", "1", average_handler)
        .unwrap();
    let echo = tm
        .bash_app("echo_pi", &["echo", "bash app says pi is ~ {0:.4f}"], "1")
        .unwrap();

    let mut fractions = Vec::new();
    for seed in 0..20u64 {
        fractions.push(fraction.submit(vec![json!(seed)]).await.unwrap());
    }
    let avg = average
        .submit(vec![serde_json::Value::Array(
            fractions.iter().map(|future| future.as_value()).collect(),
        )])
        .await
        .unwrap();
    let echoed = echo.submit(vec![avg.as_value()]).await.unwrap();

    let worker = worker_for(&tm);
    drain(&queue, &worker).await;

    let estimate = avg.result().await.unwrap().as_f64().unwrap();
    assert!(
        (3.0..3.3).contains(&estimate),
        "pi estimate {} out of range",
        estimate
    );
    let out = echoed.out().await.unwrap();
    assert_eq!(
        out.trim(),
        format!("bash app says pi is ~ {:.4}", estimate)
    );
}
