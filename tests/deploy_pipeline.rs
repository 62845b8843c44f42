//! Deployed tools flowing through to plan execution.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use ironplan::audit::{AdminLock, AuditAction, AuditLog, AuditOutcome};
use ironplan::deploy::{DeployRequest, DeploySettings, SandboxedDeployer};
use ironplan::executor::{MemoryRunStore, PlanRunner, StepExecutor};
use ironplan::plan::{OutputBag, Plan, Step};
use ironplan::testing::wat;
use ironplan::tools::builtin::EchoTool;
use ironplan::tools::wasm::{WasmRuntime, WasmRuntimeConfig};
use ironplan::tools::{ToolContext, ToolRegistry};

struct Fixture {
    registry: Arc<ToolRegistry>,
    deployer: Arc<SandboxedDeployer>,
    audit: Arc<AuditLog>,
    runner: PlanRunner,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ToolRegistry::new());
    registry.register_builtin(Arc::new(EchoTool));
    let runtime = Arc::new(WasmRuntime::new(WasmRuntimeConfig::default()).unwrap());
    let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
    let deployer = Arc::new(SandboxedDeployer::new(
        Arc::clone(&registry),
        runtime,
        Arc::clone(&audit),
        AdminLock::new(),
        DeploySettings {
            dry_run_timeout: Duration::from_millis(300),
            ..Default::default()
        },
    ));
    let runner = PlanRunner::new(
        StepExecutor::new(Arc::clone(&registry)),
        Arc::new(MemoryRunStore::new()),
    );
    Fixture {
        registry,
        deployer,
        audit,
        runner,
        _dir: dir,
    }
}

#[tokio::test]
async fn deployed_tool_is_usable_in_a_plan() {
    let f = fixture();
    f.deployer
        .deploy(DeployRequest::new("mirror", wat::ECHO_TOOL).with_description("Mirrors input"))
        .await
        .unwrap();

    let plan = Plan::new(
        "deployed-1",
        vec![
            Step::new("echo").arg("city", "Porto").save_as("input"),
            Step::new("mirror")
                .arg("from", json!({"$ref": "input"}))
                .save_as("mirrored"),
        ],
    );
    let record = f.runner.run(&plan).await;

    assert!(record.ok, "{:?}", record.error);
    let mirrored = record.outputs.get("mirrored").unwrap();
    assert_eq!(mirrored["args"], json!({"from": {"city": "Porto"}}));
    // The guest sees what earlier steps produced.
    assert_eq!(mirrored["outputs"]["input"], json!({"city": "Porto"}));
}

#[tokio::test]
async fn rejected_tool_never_becomes_visible() {
    let f = fixture();
    for (name, code) in [
        ("syntax", wat::BROKEN_SYNTAX),
        ("noexport", wat::NO_RUN_EXPORT),
        ("escape", wat::WASI_ESCAPE),
        ("trap", wat::TRAP_TOOL),
        ("spin", wat::SPIN_TOOL),
    ] {
        let generation = f.registry.generation();
        assert!(f.deployer.deploy(DeployRequest::new(name, code)).await.is_err());
        assert!(f.registry.lookup(name).is_none(), "{} was registered", name);
        assert_eq!(f.registry.generation(), generation);
    }

    let record = f
        .runner
        .run(&Plan::new("after-reject", vec![Step::new("trap")]))
        .await;
    assert_eq!(record.error.unwrap().code, "UnknownTool");
}

#[tokio::test]
async fn redeploy_replaces_and_undeploy_removes() {
    let f = fixture();
    let first = f
        .deployer
        .deploy(DeployRequest::new("swap", wat::ECHO_TOOL))
        .await
        .unwrap();
    let second = f
        .deployer
        .deploy(DeployRequest::new("swap", wat::OK_TOOL))
        .await
        .unwrap();
    assert!(second.replaced);
    assert!(second.generation > first.generation);

    let record = f
        .runner
        .run(&Plan::new("swap-1", vec![Step::new("swap").save_as("r")]))
        .await;
    assert_eq!(record.outputs.get("r"), Some(&json!({"ok": true})));

    f.deployer.undeploy("swap").await.unwrap();
    assert!(f.registry.lookup("swap").is_none());
    assert_eq!(
        f.deployer.undeploy("echo").await.unwrap_err().code(),
        "NameReserved"
    );
}

#[tokio::test]
async fn handle_taken_before_undeploy_keeps_working() {
    let f = fixture();
    f.deployer
        .deploy(DeployRequest::new("held", wat::OK_TOOL))
        .await
        .unwrap();
    let handle = f.registry.lookup("held").unwrap();
    f.deployer.undeploy("held").await.unwrap();

    let bag = OutputBag::new();
    let ctx = ToolContext {
        plan_id: "p",
        step_index: 0,
        attempt: 1,
        outputs: &bag,
    };
    let out = handle.execute(json!({}), &ctx).await.unwrap();
    assert_eq!(out.result, json!({"ok": true}));
}

#[tokio::test]
async fn concurrent_deploys_are_serialized_and_all_land() {
    let f = fixture();
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let deployer = Arc::clone(&f.deployer);
            tokio::spawn(async move {
                deployer
                    .deploy(DeployRequest::new(format!("tool-{}", i), wat::OK_TOOL))
                    .await
            })
        })
        .collect();
    let mut generations = Vec::new();
    for task in tasks {
        generations.push(task.await.unwrap().unwrap().generation);
    }
    generations.sort_unstable();
    generations.dedup();
    assert_eq!(generations.len(), 4);
    for i in 0..4 {
        assert!(f.registry.lookup(&format!("tool-{}", i)).is_some());
    }
}

#[tokio::test]
async fn audit_trail_records_outcomes_without_code() {
    let f = fixture();
    f.deployer
        .deploy(DeployRequest::new("good", wat::OK_TOOL))
        .await
        .unwrap();
    let _ = f
        .deployer
        .deploy(DeployRequest::new("bad", wat::FAIL_TOOL))
        .await;
    f.deployer.undeploy("good").await.unwrap();

    let entries = f.audit.entries().await.unwrap();
    let summary: Vec<_> = entries
        .iter()
        .map(|e| (e.action, e.name.as_str(), e.outcome))
        .collect();
    assert_eq!(
        summary,
        vec![
            (AuditAction::Deploy, "good", AuditOutcome::Accepted),
            (AuditAction::Deploy, "bad", AuditOutcome::Rejected),
            (AuditAction::Undeploy, "good", AuditOutcome::Accepted),
        ]
    );
    assert_eq!(entries[1].code.as_deref(), Some("DryRunFailed"));
    assert!(entries[0].sha256.is_some());
}
