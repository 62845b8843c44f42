//! Source replacement and rollback against real files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use ironplan::audit::{AdminLock, AuditAction, AuditLog, AuditOutcome};
use ironplan::config::RewriteConfig;
use ironplan::rewrite::{SERVICE_TOOL, SelfRewriteManager, WasmSourceValidator, load_live_source};
use ironplan::testing::{RecordingRestarter, wat};
use ironplan::tools::wasm::{WasmRuntime, WasmRuntimeConfig};

const KEY: &str = "rewrite-key";

struct Fixture {
    manager: SelfRewriteManager,
    config: RewriteConfig,
    restarter: Arc<RecordingRestarter>,
    audit: Arc<AuditLog>,
    source: PathBuf,
    backup: PathBuf,
    _dir: TempDir,
}

fn fixture(initial: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("service.wat");
    std::fs::write(&source, initial).unwrap();
    let config = RewriteConfig::new(KEY, &source);
    let backup = config.backup_path.clone();

    let runtime = Arc::new(WasmRuntime::new(WasmRuntimeConfig::default()).unwrap());
    let restarter = Arc::new(RecordingRestarter::default());
    let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
    let manager = SelfRewriteManager::new(
        config.clone(),
        Arc::new(WasmSourceValidator::new(runtime)),
        restarter.clone(),
        Arc::clone(&audit),
        AdminLock::new(),
    );
    Fixture {
        manager,
        config,
        restarter,
        audit,
        source,
        backup,
        _dir: dir,
    }
}

#[tokio::test]
async fn rewrite_then_rollback_restores_exact_bytes() {
    let f = fixture(wat::OK_TOOL);

    let outcome = f.manager.rewrite(KEY, wat::ECHO_TOOL).await.unwrap();
    assert_eq!(outcome.bytes, wat::ECHO_TOOL.len());
    assert_eq!(std::fs::read_to_string(&f.source).unwrap(), wat::ECHO_TOOL);
    assert_eq!(std::fs::read_to_string(&f.backup).unwrap(), wat::OK_TOOL);
    assert_eq!(f.restarter.count(), 1);

    f.manager.rollback(KEY).await.unwrap();
    assert_eq!(std::fs::read_to_string(&f.source).unwrap(), wat::OK_TOOL);
    assert_eq!(f.restarter.count(), 2);
    assert!(f.manager.has_backup().await);
}

#[tokio::test]
async fn rejected_source_leaves_everything_untouched() {
    let f = fixture(wat::OK_TOOL);

    let err = f.manager.rewrite(KEY, wat::BROKEN_SYNTAX).await.unwrap_err();
    assert_eq!(err.code(), "SyntaxInvalid");
    assert_eq!(std::fs::read_to_string(&f.source).unwrap(), wat::OK_TOOL);
    assert!(!f.backup.exists());
    assert_eq!(f.restarter.count(), 0);

    let entries = f.audit.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::Rewrite);
    assert_eq!(entries[0].outcome, AuditOutcome::Rejected);
    assert_eq!(entries[0].code.as_deref(), Some("SyntaxInvalid"));
}

#[tokio::test]
async fn wrong_key_is_refused_before_any_work() {
    let f = fixture(wat::OK_TOOL);

    assert_eq!(
        f.manager.rewrite("guess", wat::ECHO_TOOL).await.unwrap_err().code(),
        "Unauthorized"
    );
    assert_eq!(f.manager.rollback("guess").await.unwrap_err().code(), "Unauthorized");
    assert_eq!(std::fs::read_to_string(&f.source).unwrap(), wat::OK_TOOL);
    assert_eq!(f.restarter.count(), 0);
}

#[tokio::test]
async fn rollback_without_backup_fails() {
    let f = fixture(wat::OK_TOOL);
    assert_eq!(f.manager.rollback(KEY).await.unwrap_err().code(), "NoBackup");
    assert_eq!(std::fs::read_to_string(&f.source).unwrap(), wat::OK_TOOL);
}

#[tokio::test]
async fn only_the_latest_pre_rewrite_source_is_kept() {
    let f = fixture(wat::OK_TOOL);
    f.manager.rewrite(KEY, wat::ECHO_TOOL).await.unwrap();
    f.manager.rewrite(KEY, wat::LOG_TOOL).await.unwrap();

    f.manager.rollback(KEY).await.unwrap();
    assert_eq!(std::fs::read_to_string(&f.source).unwrap(), wat::ECHO_TOOL);
}

#[tokio::test]
async fn no_temp_files_are_left_behind() {
    let f = fixture(wat::OK_TOOL);
    f.manager.rewrite(KEY, wat::ECHO_TOOL).await.unwrap();

    let dir = f.source.parent().unwrap();
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[tokio::test]
async fn next_boot_serves_the_rewritten_source() {
    let f = fixture(wat::OK_TOOL);
    let input = json!({"args": {"city": "Oslo"}, "outputs": {}});

    let runtime = Arc::new(WasmRuntime::new(WasmRuntimeConfig::default()).unwrap());
    let before = load_live_source(&f.config, &runtime, Duration::from_secs(1)).unwrap();
    assert_eq!(before.invoke(input.clone()).await.unwrap(), json!({"ok": true}));

    f.manager.rewrite(KEY, wat::ECHO_TOOL).await.unwrap();

    // What the restarted process loads.
    let after = load_live_source(&f.config, &runtime, Duration::from_secs(1)).unwrap();
    assert_eq!(ironplan::tools::Tool::name(&after), SERVICE_TOOL);
    let out = after.invoke(input).await.unwrap();
    assert_eq!(out["args"], json!({"city": "Oslo"}));
}
