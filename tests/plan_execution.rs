//! End-to-end plan execution against a real run log on disk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::tempdir;

use ironplan::executor::{
    CancelToken, FsRunStore, MemoryRunStore, PlanRunner, RetryPolicy, RunStore, StepExecutor,
};
use ironplan::plan::{Plan, Step, StepStatus};
use ironplan::testing::{ScriptedTool, StubLlm};
use ironplan::tools::ToolRegistry;
use ironplan::tools::builtin::{EchoTool, LlmGenerateTool};

fn runner_with(
    tools: &[Arc<ScriptedTool>],
    store: Arc<dyn RunStore>,
    timeout: Duration,
) -> PlanRunner {
    let registry = Arc::new(ToolRegistry::new());
    registry.register_builtin(Arc::new(EchoTool));
    for tool in tools {
        registry.register_builtin(tool.clone());
    }
    let executor = StepExecutor::new(registry)
        .with_timeout(timeout)
        .with_retry(RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_millis(5),
        });
    PlanRunner::new(executor, store)
}

#[tokio::test]
async fn flaky_step_recovers_within_retry_budget() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FsRunStore::new(dir.path().join("runs.jsonl")));
    let flaky = Arc::new(ScriptedTool::new("flaky").fail_times(2));
    let runner = runner_with(&[flaky.clone()], store.clone(), Duration::from_secs(1));

    let plan = Plan::new(
        "retry-1",
        vec![
            Step::new("echo").arg("city", "Lisbon").save_as("input"),
            Step::new("flaky")
                .arg("where", json!({"$ref": "input"}))
                .save_as("weather"),
        ],
    );
    let record = runner.run(&plan).await;

    assert!(record.ok);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(record.step_results[1].attempts, 3);
    assert_eq!(
        record.outputs.get("weather"),
        Some(&json!({"where": {"city": "Lisbon"}}))
    );

    let persisted = store.latest("retry-1").await.unwrap().unwrap();
    assert_eq!(persisted["ok"], true);
    assert_eq!(persisted["outputs"]["weather"]["where"]["city"], "Lisbon");
}

#[tokio::test]
async fn timeouts_are_retried_then_reported() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FsRunStore::new(dir.path().join("runs.jsonl")));
    let slow = Arc::new(ScriptedTool::new("slow").with_delay(Duration::from_secs(5)));
    let runner = runner_with(&[slow.clone()], store, Duration::from_millis(50));

    let start = Instant::now();
    let record = runner.run(&Plan::new("slow-1", vec![Step::new("slow")])).await;

    assert!(!record.ok);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(slow.calls(), 3);
    let failure = record.error.unwrap();
    assert_eq!(failure.code, "StepFailed");
    assert_eq!(failure.cause.as_deref(), Some("Timeout"));
}

#[tokio::test]
async fn invalid_parameters_are_not_retried() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FsRunStore::new(dir.path().join("runs.jsonl")));
    let strict = Arc::new(ScriptedTool::new("strict").reject_params());
    let runner = runner_with(&[strict.clone()], store, Duration::from_secs(1));

    let record = runner.run(&Plan::new("strict-1", vec![Step::new("strict")])).await;
    assert!(!record.ok);
    assert_eq!(strict.calls(), 1);
    assert_eq!(record.step_results[0].status, StepStatus::Failed);
}

#[tokio::test]
async fn unresolved_reference_stops_before_the_tool_runs() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FsRunStore::new(dir.path().join("runs.jsonl")));
    let sink = Arc::new(ScriptedTool::new("sink"));
    let runner = runner_with(&[sink.clone()], store, Duration::from_secs(1));

    let record = runner
        .run(&Plan::new(
            "ref-1",
            vec![Step::new("sink").arg("x", "$ref:missing")],
        ))
        .await;
    assert_eq!(record.error.unwrap().code, "UnresolvedReference");
    assert_eq!(sink.calls(), 0);
}

#[tokio::test]
async fn later_save_as_overwrites_earlier() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FsRunStore::new(dir.path().join("runs.jsonl")));
    let runner = runner_with(&[], store, Duration::from_secs(1));

    let record = runner
        .run(&Plan::new(
            "dup-1",
            vec![
                Step::new("echo").arg("v", 1).save_as("x"),
                Step::new("echo").arg("v", 2).save_as("x"),
            ],
        ))
        .await;
    assert!(record.ok);
    assert_eq!(record.outputs.len(), 1);
    assert_eq!(record.outputs.get("x"), Some(&json!({"v": 2})));
}

#[tokio::test]
async fn run_log_keeps_every_run_and_latest_wins() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("runs.jsonl");
    let store = Arc::new(FsRunStore::new(&path));
    let runner = runner_with(&[], store.clone(), Duration::from_secs(1));

    runner
        .run(&Plan::new("same", vec![Step::new("echo").arg("n", 1).save_as("n")]))
        .await;
    runner
        .run(&Plan::new("same", vec![Step::new("echo").arg("n", 2).save_as("n")]))
        .await;

    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 2);
    let latest = store.latest("same").await.unwrap().unwrap();
    assert_eq!(latest["outputs"]["n"]["n"], 2);
}

#[tokio::test]
async fn secrets_in_outputs_are_redacted_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("runs.jsonl");
    let store = Arc::new(FsRunStore::new(&path));
    let runner = runner_with(&[], store, Duration::from_secs(1));

    let record = runner
        .run(&Plan::new(
            "redact-1",
            vec![Step::new("echo").arg("api_key", "sk-live-123").save_as("creds")],
        ))
        .await;
    assert!(record.ok);
    // The in-memory record is untouched; only the persisted copy is redacted.
    assert_eq!(record.outputs.get("creds"), Some(&json!({"api_key": "sk-live-123"})));
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains("sk-live-123"));
}

#[tokio::test]
async fn cancel_between_steps_keeps_completed_outputs() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FsRunStore::new(dir.path().join("runs.jsonl")));
    let slow = Arc::new(ScriptedTool::new("slow").with_delay(Duration::from_millis(100)));
    let after = Arc::new(ScriptedTool::new("after"));
    let runner = Arc::new(runner_with(
        &[slow.clone(), after.clone()],
        store,
        Duration::from_secs(1),
    ));

    let cancel = CancelToken::new();
    let plan = Plan::new(
        "cancel-1",
        vec![
            Step::new("slow").arg("a", 1).save_as("a"),
            Step::new("after"),
        ],
    );
    let task = {
        let runner = runner.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run_with_cancel(&plan, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let record = task.await.unwrap();

    assert!(!record.ok);
    assert_eq!(record.error.as_ref().unwrap().code, "Cancelled");
    assert_eq!(record.success_count, 1);
    assert!(record.outputs.contains("a"));
    assert_eq!(after.calls(), 0);
}

#[tokio::test]
async fn generated_text_flows_into_the_fetch_body() {
    let llm = Arc::new(StubLlm::new("hello"));
    let fetch = Arc::new(ScriptedTool::new("http.fetch"));
    let registry = Arc::new(ToolRegistry::new());
    registry.register_builtin(Arc::new(LlmGenerateTool::new(llm.clone())));
    registry.register_builtin(fetch.clone());
    let runner = PlanRunner::new(StepExecutor::new(registry), Arc::new(MemoryRunStore::new()));

    let plan: Plan = serde_json::from_value(json!({
        "planId": "greet-1",
        "steps": [
            {"tool": "llm.generate", "args": {"prompt": "hi"}, "saveAs": "greeting"},
            {"tool": "http.fetch", "args": {"url": "https://example.test", "body": "$ref:greeting"}}
        ]
    }))
    .unwrap();
    let record = runner.run(&plan).await;

    assert!(record.ok, "{:?}", record.error);
    assert_eq!(llm.calls(), 1);
    assert_eq!(record.outputs.get("greeting"), Some(&json!("hello")));
    let args = fetch.last_args().unwrap();
    assert_eq!(args["body"], "hello");
    assert_ne!(args["body"], "$ref:greeting");
    assert_eq!(args["url"], "https://example.test");
}
