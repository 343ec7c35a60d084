//! End-to-end scenarios: full runs driven through the executor facade.

mod common;

use serde_json::{json, Value};
use sl_core::Error;
use sl_dag::{Flow, FlowBuilder, FnHandler, StepHandler, StepOptions};
use sl_engine::Executor;
use sl_storage::models::{RunStatus, StepStatus, TaskStatus};
use sl_storage::RunsRepo;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn echo(slug: &str) -> Arc<dyn StepHandler> {
    Arc::new(FnHandler::new(slug, |input| async move { Ok(input) }))
}

fn annotate(slug: &str, key: &str, value: Value) -> Arc<dyn StepHandler> {
    let key = key.to_string();
    Arc::new(FnHandler::new(slug, move |input| {
        let key = key.clone();
        let value = value.clone();
        async move {
            let mut out = input;
            out[key.as_str()] = value;
            Ok(out)
        }
    }))
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn single_step_run_returns_merged_output() {
    let pool = common::pool().await;
    let flow = FlowBuilder::new(common::unique_slug("single"))
        .step("s", &[], annotate("s", "r", json!("done")))
        .build()
        .unwrap();

    let output = Executor::new(pool)
        .execute(&flow, json!({"test": "data"}))
        .await
        .unwrap();

    assert_eq!(output, json!({"test": "data", "r": "done"}));
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn sequential_chain_respects_happens_before() {
    let pool = common::pool().await;
    let flow = FlowBuilder::new(common::unique_slug("chain"))
        .step("s1", &[], annotate("s1", "a", json!(1)))
        .step("s2", &["s1"], annotate("s2", "b", json!(2)))
        .build()
        .unwrap();

    let executor = Executor::new(pool);
    let run_id = executor.start(&flow, json!({})).await.unwrap();
    let output = executor
        .wait(run_id, Duration::from_millis(100), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(output, json!({"a": 1, "b": 2}));

    let status = executor.status(run_id).await.unwrap();
    assert_eq!(status.state, RunStatus::Completed);
    let s1 = status.steps.iter().find(|s| s.slug == "s1").unwrap();
    let s2 = status.steps.iter().find(|s| s.slug == "s2").unwrap();
    assert!(s2.started_at.unwrap() >= s1.completed_at.unwrap());
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn diamond_merges_both_branches() {
    let pool = common::pool().await;
    let flow = FlowBuilder::new(common::unique_slug("diamond"))
        .step("root", &[], annotate("root", "r", json!("R")))
        .step("l", &["root"], annotate("l", "l", json!("L")))
        .step("r", &["root"], annotate("r", "r2", json!("R2")))
        .step("merge", &["l", "r"], echo("merge"))
        .build()
        .unwrap();

    let output = Executor::new(pool).execute(&flow, json!({})).await.unwrap();

    assert_eq!(output["r"], json!("R"));
    assert_eq!(output["l"], json!("L"));
    assert_eq!(output["r2"], json!("R2"));
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn retryable_failure_succeeds_on_third_attempt() {
    let pool = common::pool().await;
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_step = calls.clone();

    let flaky: Arc<dyn StepHandler> = Arc::new(FnHandler::new("flaky", move |input| {
        let calls = calls_in_step.clone();
        async move {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(anyhow::anyhow!("transient failure on attempt {attempt}"))
            } else {
                let mut out = input;
                out["settled"] = json!(attempt);
                Ok(out)
            }
        }
    }));

    let flow = FlowBuilder::new(common::unique_slug("retry"))
        .step_with("flaky", &[], StepOptions::default().max_attempts(3), flaky)
        .build()
        .unwrap();

    let executor = Executor::new(pool.clone());
    let output = executor.execute(&flow, json!({})).await.unwrap();
    assert_eq!(output["settled"], json!(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let status = executor
        .status(latest_run(&pool, &flow).await)
        .await
        .unwrap();
    let step = status.steps.iter().find(|s| s.slug == "flaky").unwrap();
    assert_eq!(step.state, StepStatus::Completed);
    assert_eq!(step.attempts, 3);
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn exhausted_retries_fail_the_run() {
    let pool = common::pool().await;
    let boom: Arc<dyn StepHandler> = Arc::new(FnHandler::new("boom", |_| async move {
        Err(anyhow::anyhow!("boom"))
    }));

    let flow = FlowBuilder::new(common::unique_slug("exhaust"))
        .step_with("boom", &[], StepOptions::default().max_attempts(2), boom)
        .build()
        .unwrap();

    let executor = Executor::new(pool.clone());
    let err = executor.execute(&flow, json!({})).await.unwrap_err();
    match &err {
        Error::RunFailed { message } => assert!(message.contains("boom")),
        other => panic!("unexpected error: {other:?}"),
    }

    let run_id = latest_run(&pool, &flow).await;
    let runs = RunsRepo::new(pool);
    let run = runs.get(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("boom"));

    let task = runs.get_task(run_id, "boom", 0).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts_count, task.max_attempts);
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn map_step_fans_out_and_aggregates() {
    let pool = common::pool().await;

    let fetch = annotate("fetch", "items", json!([10, 20, 30]));
    let process: Arc<dyn StepHandler> = Arc::new(FnHandler::new("process", |input| async move {
        let item = input["item"].as_i64().unwrap_or_default();
        let mut out = input;
        out["doubled"] = json!(item * 2);
        Ok(out)
    }));

    let flow = FlowBuilder::new(common::unique_slug("fanout"))
        .step("fetch", &[], fetch)
        .map_step_with(
            "process",
            Some("fetch"),
            StepOptions::default().initial_tasks(3),
            process,
        )
        .step("agg", &["process"], echo("agg"))
        .build()
        .unwrap();

    let executor = Executor::new(pool.clone());
    let output = executor.execute(&flow, json!({})).await.unwrap();

    let processed = output["process"].as_array().expect("aggregated list");
    let doubled: Vec<i64> = processed
        .iter()
        .map(|entry| entry["doubled"].as_i64().unwrap())
        .collect();
    assert_eq!(doubled, vec![20, 40, 60]);

    let run_id = latest_run(&pool, &flow).await;
    let runs = RunsRepo::new(pool);

    let tasks = runs.list_tasks(run_id, "process").await.unwrap();
    assert_eq!(tasks.len(), 3);
    let items: Vec<i64> = tasks
        .iter()
        .map(|t| t.input["item"].as_i64().unwrap())
        .collect();
    assert_eq!(items, vec![10, 20, 30]);

    // The aggregator must start only after the slowest map task finished.
    let last_task_done = tasks.iter().map(|t| t.completed_at.unwrap()).max().unwrap();
    let states = runs.list_step_states(run_id).await.unwrap();
    let agg = states.iter().find(|s| s.step_slug == "agg").unwrap();
    assert!(agg.started_at.unwrap() >= last_task_done);
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn empty_input_reflects_leaf_outputs_only() {
    let pool = common::pool().await;
    let flow = FlowBuilder::new(common::unique_slug("empty_input"))
        .step("only", &[], annotate("only", "leaf", json!(true)))
        .build()
        .unwrap();

    let output = Executor::new(pool).execute(&flow, json!({})).await.unwrap();
    assert_eq!(output, json!({"leaf": true}));
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn zero_task_map_step_completes_instantly() {
    let pool = common::pool().await;
    let flow = FlowBuilder::new(common::unique_slug("zero_fanout"))
        .map_step_with(
            "nothing",
            None,
            StepOptions::default().initial_tasks(0),
            echo("nothing"),
        )
        .build()
        .unwrap();

    let executor = Executor::new(pool.clone());
    let output = executor.execute(&flow, json!({"kept": 1})).await.unwrap();
    assert_eq!(output, json!({"kept": 1}));

    let run_id = latest_run(&pool, &flow).await;
    let runs = RunsRepo::new(pool);
    let states = runs.list_step_states(run_id).await.unwrap();
    assert_eq!(states[0].status, StepStatus::Completed);
    assert_eq!(states[0].initial_tasks, Some(0));
    assert_eq!(states[0].output, Some(json!({})));
    assert!(runs.list_tasks(run_id, "nothing").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn zero_max_attempts_fails_on_first_failure() {
    let pool = common::pool().await;
    let boom: Arc<dyn StepHandler> = Arc::new(FnHandler::new("boom", |_| async move {
        Err(anyhow::anyhow!("no second chances"))
    }));

    let flow = FlowBuilder::new(common::unique_slug("no_retries"))
        .step_with("boom", &[], StepOptions::default().max_attempts(0), boom)
        .build()
        .unwrap();

    let err = Executor::new(pool).execute(&flow, json!({})).await.unwrap_err();
    assert!(matches!(err, Error::RunFailed { .. }));
}

#[tokio::test]
#[ignore = "requires a provisioned Postgres (DATABASE_URL)"]
async fn metrics_report_completed_run() {
    let pool = common::pool().await;
    let flow = FlowBuilder::new(common::unique_slug("metrics"))
        .step("a", &[], annotate("a", "a", json!(1)))
        .step("b", &["a"], annotate("b", "b", json!(2)))
        .build()
        .unwrap();

    let executor = Executor::new(pool.clone());
    executor.execute(&flow, json!({})).await.unwrap();

    let run_id = latest_run(&pool, &flow).await;
    let metrics = executor.metrics(run_id).await.unwrap();
    assert!(metrics.execution_time_ms >= 0);
    assert_eq!(metrics.success_rate, 1.0);
    assert_eq!(metrics.error_rate, 0.0);

    // Missing runs yield zeros rather than an error.
    let absent = executor.metrics(uuid::Uuid::new_v4()).await.unwrap();
    assert_eq!(absent.execution_time_ms, 0);
    assert_eq!(absent.success_rate, 0.0);
}

/// The id of the most recent run of `flow`. Tests create one run per
/// uniquely-slugged flow, so this is unambiguous.
async fn latest_run(pool: &sl_storage::DbPool, flow: &Flow) -> uuid::Uuid {
    sqlx::query_scalar(
        "SELECT run_id FROM workflow_runs WHERE workflow_slug = $1 ORDER BY started_at DESC LIMIT 1",
    )
    .bind(flow.slug())
    .fetch_one(pool)
    .await
    .unwrap()
}
