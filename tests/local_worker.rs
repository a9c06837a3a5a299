// tests/local_worker.rs

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{json, Value};

use workforce::handler::{HandlerOptions, TaskHandler, TerminateOptions};
use workforce::task::{TaskCall, TaskOutcome};
use workforce::worker::{FunctionRegistry, LocalWorker, Worker};
use workforce::WorkforceError;
use workforce_test_utils::{init_tracing, with_timeout, TaskBuilder};

type TestResult = Result<(), Box<dyn Error>>;

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register("add", |call: TaskCall| async move {
            let sum: i64 = call.args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        })
        .register("greet", |call: TaskCall| async move {
            let name = call
                .kwargs
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("world")
                .to_string();
            Ok(json!(format!("hello, {name}")))
        })
        .register("fail", |_call: TaskCall| async move {
            Err(anyhow!("deliberate failure"))
        })
        .register("nap", |call: TaskCall| async move {
            let millis = call.args.first().and_then(Value::as_u64).unwrap_or(10_000);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!("rested"))
        })
        .register("explode", |call: TaskCall| async move {
            if call.args.is_empty() {
                panic!("explode called without a fuse");
            }
            Ok(Value::Null)
        });
    registry
}

#[tokio::test]
async fn runs_registered_functions_through_the_handler() -> TestResult {
    init_tracing();
    let handler = TaskHandler::spawn(HandlerOptions::default());
    handler.hire(Arc::new(LocalWorker::new(registry()))).await?;

    let add = TaskBuilder::new("add").arg(json!(2)).arg(json!(40)).build();
    let greet = TaskBuilder::new("greet").kwarg("name", json!("queue")).build();
    let (add_result, greet_result) = (add.result(), greet.result());
    handler.submit(add).await?;
    handler.submit(greet).await?;

    assert_eq!(
        with_timeout(add_result.wait()).await?,
        TaskOutcome::Completed(json!(42))
    );
    assert_eq!(
        with_timeout(greet_result.wait()).await?,
        TaskOutcome::Completed(json!("hello, queue"))
    );
    Ok(())
}

#[tokio::test]
async fn serves_the_local_series_and_its_own() -> TestResult {
    init_tracing();
    let handler = TaskHandler::spawn(HandlerOptions::default());
    let worker = LocalWorker::new(registry()).with_series(["cpu"]);
    let id = handler.hire(Arc::new(worker)).await?;

    assert_eq!(handler.roster(Some("local".into())).await?, vec![id]);
    assert_eq!(handler.roster(Some("cpu".into())).await?, vec![id]);

    let task = TaskBuilder::new("add").arg(json!(1)).series("cpu").build();
    let result = task.result();
    handler.submit(task).await?;
    assert_eq!(
        with_timeout(result.wait()).await?,
        TaskOutcome::Completed(json!(1))
    );
    Ok(())
}

#[tokio::test]
async fn errors_and_unknown_targets_fail_the_task() -> TestResult {
    let worker = LocalWorker::new(registry());

    let failing = TaskBuilder::new("fail").build();
    let failing_result = failing.result();
    with_timeout(worker.run(failing)).await;
    match failing_result.peek() {
        Some(TaskOutcome::Failed(reason)) => assert!(reason.contains("deliberate failure")),
        other => panic!("expected a failure, got {other:?}"),
    }

    let unknown = TaskBuilder::new("nope").build();
    let unknown_result = unknown.result();
    with_timeout(worker.run(unknown)).await;
    match unknown_result.peek() {
        Some(TaskOutcome::Failed(reason)) => assert!(reason.contains("nope")),
        other => panic!("expected a failure, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn empty_registry_is_rejected_on_hire() {
    init_tracing();
    let handler = TaskHandler::spawn(HandlerOptions::default());
    let err = handler
        .hire(Arc::new(LocalWorker::new(FunctionRegistry::new())))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkforceError::Implementation(_)));
}

#[tokio::test]
async fn stop_waits_for_tasks_in_flight() -> TestResult {
    let worker = LocalWorker::new(registry());
    let task = TaskBuilder::new("nap").arg(json!(30)).build();
    let result = task.result();

    let ready = worker.run(task);
    assert_eq!(worker.in_flight(), 1);

    let unfinished = with_timeout(worker.stop()).await;
    assert!(unfinished.is_empty());
    assert_eq!(worker.in_flight(), 0);
    assert_eq!(result.peek(), Some(TaskOutcome::Completed(json!("rested"))));
    with_timeout(ready).await;

    let late = TaskBuilder::new("add").build();
    let late_result = late.result();
    worker.run(late).await;
    assert!(matches!(late_result.peek(), Some(TaskOutcome::Failed(_))));
    Ok(())
}

#[tokio::test]
async fn crash_aborts_and_returns_tasks_in_flight() {
    let worker = LocalWorker::new(registry());
    let ready_one = worker.run(TaskBuilder::new("nap").build());
    let ready_two = worker.run(TaskBuilder::new("nap").build());
    assert_eq!(worker.in_flight(), 2);

    let unfinished = worker.crash();
    assert_eq!(unfinished.len(), 2);
    assert!(unfinished.iter().all(|t| !t.is_resolved()));
    assert_eq!(worker.in_flight(), 0);

    with_timeout(ready_one).await;
    with_timeout(ready_two).await;
}

#[tokio::test]
async fn panicking_function_fails_its_task_and_the_worker_resigns() -> TestResult {
    init_tracing();
    let handler = TaskHandler::spawn(HandlerOptions::default());
    let id = handler.hire(Arc::new(LocalWorker::new(registry()))).await?;

    let task = TaskBuilder::new("explode").build();
    let result = task.result();
    handler.submit(task).await?;

    match with_timeout(result.wait()).await? {
        TaskOutcome::Failed(reason) => assert!(reason.contains("panicked")),
        other => panic!("expected a failure, got {other:?}"),
    }

    with_timeout(async {
        while handler.roster(None).await.map(|r| r.contains(&id)).unwrap_or(false) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    let unfinished = handler.terminate(id, TerminateOptions::default()).await?;
    assert!(unfinished.is_empty(), "already gone");
    Ok(())
}
