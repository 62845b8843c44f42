//! HTTP gateway tests driven through the router with `oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use ironplan::config::{Config, RewriteConfig};
use ironplan::plan::{Plan, Step};
use ironplan::server::{AppState, router};
use ironplan::testing::{RecordingRestarter, ScriptedTool, StubPlanner, wat};
use ironplan::webhook::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};

const ADMIN: &str = "admin-token";
const REWRITE_KEY: &str = "rewrite-key";
const WEBHOOK_SECRET: &str = "local-webhook-secret";

struct Harness {
    app: Router,
    planner: Arc<StubPlanner>,
    restarter: Arc<RecordingRestarter>,
    dir: TempDir,
}

fn harness_with(planner: StubPlanner, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("service.wat");
    std::fs::write(&source, wat::OK_TOOL).unwrap();

    let mut config = Config::local(ADMIN, dir.path());
    config.rewrite = RewriteConfig::new(REWRITE_KEY, &source);
    config.executor.backoff_base = Duration::from_millis(1);
    config.sandbox.dry_run_timeout = Duration::from_millis(300);
    // Some tests poll; the limiter has its own coverage.
    config.gateway.rate_limit_per_minute = 0;
    tweak(&mut config);

    let planner = Arc::new(planner);
    let restarter = Arc::new(RecordingRestarter::default());
    let state = AppState::builder(config)
        .planner(planner.clone())
        .restarter(restarter.clone())
        .builtin(Arc::new(ScriptedTool::new("broken").fail_times(u32::MAX)))
        .build()
        .unwrap();
    Harness {
        app: router(Arc::new(state)),
        planner,
        restarter,
        dir,
    }
}

fn harness() -> Harness {
    let plan = Plan::new(
        "",
        vec![
            Step::new("echo").arg("greeting", "hello").save_as("first"),
            Step::new("echo").arg("again", "$ref:first").save_as("second"),
        ],
    );
    harness_with(StubPlanner::new(plan), |_| {})
}

fn admin(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", ADMIN))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn signed_webhook(body: &str, timestamp_ms: i64) -> Request<Body> {
    let signature = webhook::sign(WEBHOOK_SECRET.as_bytes(), timestamp_ms, body.as_bytes());
    Request::builder()
        .method("POST")
        .uri("/rta/webhook")
        .header("content-type", "application/json")
        .header(TIMESTAMP_HEADER, timestamp_ms.to_string())
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// --- Execute ---

#[tokio::test]
async fn execute_threads_refs_and_reports_outputs() {
    let h = harness();
    let plan = json!({
        "planId": "exec-1",
        "steps": [
            {"tool": "echo", "args": {"n": 1}, "saveAs": "a"},
            {"tool": "echo", "args": {"prev": {"$ref": "a"}}, "saveAs": "b"}
        ]
    });
    let (status, body) = send(&h.app, admin("POST", "/execute", plan)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["planId"], "exec-1");
    assert_eq!(body["outputs"]["b"], json!({"prev": {"n": 1}}));
    assert!(body["tookMs"].is_u64());
}

#[tokio::test]
async fn execute_failure_keeps_partial_outputs() {
    let h = harness();
    let plan = json!({
        "planId": "exec-2",
        "steps": [
            {"tool": "echo", "args": {"n": 1}, "saveAs": "a"},
            {"tool": "broken"},
            {"tool": "echo", "args": {}, "saveAs": "never"}
        ]
    });
    let (status, body) = send(&h.app, admin("POST", "/execute", plan)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "StepFailed");
    assert_eq!(body["outputs"]["a"], json!({"n": 1}));
    assert!(body["outputs"].get("never").is_none());
    assert_eq!(body["stepResults"][2]["status"], "skipped");

    let (status, run) = send(&h.app, admin("GET", "/runs/exec-2", Value::Null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["run"]["failCount"], 1);
}

#[tokio::test]
async fn execute_without_plan_id_gets_adhoc_id() {
    let h = harness();
    let (_, body) = send(
        &h.app,
        admin("POST", "/execute", json!({"steps": [{"tool": "echo"}]})),
    )
    .await;
    assert!(body["planId"].as_str().unwrap().starts_with("adhoc-"));
}

#[tokio::test]
async fn malformed_body_is_invalid_request() {
    let h = harness();
    let request = Request::builder()
        .method("POST")
        .uri("/execute")
        .header("authorization", format!("Bearer {}", ADMIN))
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "InvalidRequest");
}

#[tokio::test]
async fn oversized_body_is_refused() {
    let h = harness_with(StubPlanner::unavailable(), |c| c.gateway.body_limit_bytes = 256);
    let big = json!({"steps": [{"tool": "echo", "args": {"blob": "x".repeat(4096)}}]});
    let (status, _) = send(&h.app, admin("POST", "/execute", big)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn wrong_token_is_unauthorized() {
    let h = harness();
    let request = Request::builder()
        .method("POST")
        .uri("/execute")
        .header("authorization", "Bearer nope")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"steps":[]}"#))
        .unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");
}

// --- Orchestrate ---

#[tokio::test]
async fn orchestrate_returns_the_plan() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        admin("POST", "/orchestrate", json!({"instruction": "greet twice", "context": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["steps"].as_array().unwrap().len(), 2);
    assert_eq!(h.planner.instructions(), vec!["greet twice".to_string()]);
}

#[tokio::test]
async fn orchestrate_reports_planner_outage() {
    let h = harness_with(StubPlanner::unavailable(), |_| {});
    let (status, body) = send(
        &h.app,
        admin("POST", "/orchestrate", json!({"instruction": "anything"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "PlannerUnavailable");
}

// --- Webhook ---

#[tokio::test]
async fn signed_webhook_waits_for_the_run() {
    let h = harness();
    let body = r#"{"instruction":"ping","context":{"source":"rta"},"wait":true}"#;
    let (status, out) = send(&h.app, signed_webhook(body, now_ms())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["ok"], true);
    assert!(out["planId"].is_string());
    assert_eq!(out["out"]["outputs"]["second"]["again"]["greeting"], "hello");
    assert_eq!(h.planner.instructions(), vec!["ping".to_string()]);
}

#[tokio::test]
async fn webhook_without_wait_is_accepted_and_runs_in_background() {
    let h = harness();
    let (status, out) = send(&h.app, signed_webhook("{}", now_ms())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(h.planner.instructions(), vec!["webhook-triggered".to_string()]);

    let plan_id = out["planId"].as_str().unwrap().to_string();
    let uri = format!("/runs/{}", plan_id);
    let mut found = false;
    for _ in 0..100 {
        let (status, _) = send(&h.app, admin("GET", &uri, Value::Null)).await;
        if status == StatusCode::OK {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(found, "background run for {} never persisted", plan_id);
}

#[tokio::test]
async fn tampered_or_stale_webhook_is_rejected() {
    let h = harness();
    let ts = now_ms();

    let mut tampered = signed_webhook(r#"{"instruction":"a"}"#, ts);
    *tampered.body_mut() = Body::from(r#"{"instruction":"b"}"#);
    let (status, body) = send(&h.app, tampered).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "BadSignature");

    let stale = signed_webhook("{}", ts - 10 * 60 * 1000);
    let (status, body) = send(&h.app, stale).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "StaleTimestamp");

    let unsigned = Request::builder()
        .method("POST")
        .uri("/rta/webhook")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(&h.app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(h.planner.instructions().is_empty());
}

// --- Deploy ---

#[tokio::test]
async fn deploy_list_execute_undeploy() {
    let h = harness();
    let (status, receipt) = send(
        &h.app,
        admin(
            "POST",
            "/deploy",
            json!({"name": "weather.stub", "code": wat::OK_TOOL, "description": "Stub"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["ok"], true);
    assert_eq!(receipt["stage"], "registered");

    let (_, tools) = send(&h.app, admin("GET", "/tools", Value::Null)).await;
    let names: Vec<&str> = tools["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"weather.stub"));
    assert!(names.contains(&"echo"));

    let (status, run) = send(
        &h.app,
        admin(
            "POST",
            "/execute",
            json!({"steps": [{"tool": "weather.stub", "saveAs": "w"}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["outputs"]["w"], json!({"ok": true}));

    let (status, _) = send(&h.app, admin("DELETE", "/tools/weather.stub", Value::Null)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&h.app, admin("DELETE", "/tools/weather.stub", Value::Null)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "UnknownTool");
}

#[tokio::test]
async fn deploy_rejections_map_to_status_codes() {
    let h = harness();
    let cases = [
        (json!({"name": "echo", "code": wat::OK_TOOL}), StatusCode::CONFLICT, "NameReserved"),
        (json!({"name": "../x", "code": wat::OK_TOOL}), StatusCode::BAD_REQUEST, "InvalidName"),
        (
            json!({"name": "broken.syntax", "code": wat::BROKEN_SYNTAX}),
            StatusCode::UNPROCESSABLE_ENTITY,
            "SyntaxInvalid",
        ),
        (
            json!({"name": "traps", "code": wat::TRAP_TOOL}),
            StatusCode::UNPROCESSABLE_ENTITY,
            "DryRunFailed",
        ),
    ];
    for (request, expected_status, expected_code) in cases {
        let (status, body) = send(&h.app, admin("POST", "/deploy", request)).await;
        assert_eq!(status, expected_status);
        assert_eq!(body["error"], expected_code);
    }
}

#[tokio::test]
async fn deploy_check_does_not_register() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        admin("POST", "/deploy/check", json!({"name": "dry.only", "code": wat::OK_TOOL})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stage"], "dry_run");

    let (_, tools) = send(&h.app, admin("GET", "/tools", Value::Null)).await;
    assert!(
        !tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["name"] == "dry.only")
    );
}

// --- Self-rewrite ---

#[tokio::test]
async fn rewrite_needs_its_own_key() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        admin("POST", "/self/rewrite", json!({"secret": ADMIN, "code": wat::ECHO_TOOL})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");
    assert_eq!(h.restarter.count(), 0);
}

#[tokio::test]
async fn rewrite_and_rollback_over_http() {
    let h = harness();
    let source = h.dir.path().join("service.wat");

    let (status, body) = send(
        &h.app,
        admin("POST", "/self/rewrite", json!({"secret": REWRITE_KEY, "code": wat::ECHO_TOOL})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(std::fs::read_to_string(&source).unwrap(), wat::ECHO_TOOL);
    assert_eq!(h.restarter.count(), 1);

    let (status, _) = send(
        &h.app,
        admin("POST", "/self/rollback", json!({"secret": REWRITE_KEY})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(std::fs::read_to_string(&source).unwrap(), wat::OK_TOOL);
}

#[tokio::test]
async fn rewrite_rejects_invalid_source() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        admin("POST", "/self/rewrite", json!({"secret": REWRITE_KEY, "code": "(module"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "SyntaxInvalid");
    assert_eq!(h.restarter.count(), 0);
}

// --- Health ---

#[tokio::test]
async fn healthz_reports_features_and_tools() {
    let h = harness();
    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["features"]["rewrite"], true);
    assert_eq!(body["features"]["deploy"], true);
    // echo, http.fetch, the scripted test tool and the live source
    assert_eq!(body["tools"], 4);
}
