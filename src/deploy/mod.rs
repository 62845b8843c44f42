//! Runtime admission of tool code.
//!
//! A deploy request walks `Received -> SyntaxChecked -> Sandboxed -> DryRun ->
//! Registered`. Any stage may reject, and a rejected request leaves the
//! registry exactly as it was: the tool is installed only after its dry run
//! has completed.

mod name;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit::{AdminLock, AuditAction, AuditEntry, AuditLog, AuditOutcome, sha256_hex};
use crate::config::SandboxConfig;
use crate::error::{DeployError, RegistryError, WasmError};
use crate::tools::ToolRegistry;
use crate::tools::wasm::{Capabilities, CapabilityKind, HttpCapability, WasmRuntime, WasmTool};

pub use name::validate_tool_name;

/// Arguments handed to a deployed tool during its dry run.
pub fn dry_run_args() -> serde_json::Value {
    serde_json::json!({ "test": true })
}

/// Tool code submitted for deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub name: String,
    /// Module source, WebAssembly text or binary.
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional capabilities such as `"http"`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl DeployRequest {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            description: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    Received,
    SyntaxChecked,
    Sandboxed,
    DryRun,
    Registered,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::SyntaxChecked => "syntax_checked",
            Self::Sandboxed => "sandboxed",
            Self::DryRun => "dry_run",
            Self::Registered => "registered",
        }
    }
}

impl std::fmt::Display for DeployStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof of a successful deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployReceipt {
    pub name: String,
    pub stage: DeployStage,
    /// An earlier deployed tool of the same name was replaced.
    pub replaced: bool,
    pub sha256: String,
    /// Registry generation that first contains the tool.
    pub generation: u64,
    pub dry_run_output: serde_json::Value,
}

/// Outcome of running the pipeline without registering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub name: String,
    pub stage: DeployStage,
    pub sha256: String,
    pub dry_run_output: serde_json::Value,
}

/// A rejection together with the last stage the request had passed.
#[derive(Debug)]
pub struct Rejection {
    pub stage: DeployStage,
    pub error: DeployError,
}

impl Rejection {
    fn at(stage: DeployStage, error: DeployError) -> Self {
        Self { stage, error }
    }
}

/// Deployer knobs, usually taken from [`SandboxConfig`].
#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub enabled: bool,
    pub dry_run_timeout: Duration,
    pub tool_timeout: Duration,
    /// Offered to requests asking for `http`. `None` refuses them.
    pub http: Option<HttpCapability>,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run_timeout: Duration::from_secs(3),
            tool_timeout: Duration::from_secs(10),
            http: None,
        }
    }
}

impl From<&SandboxConfig> for DeploySettings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            enabled: config.deploy_enabled,
            dry_run_timeout: config.dry_run_timeout,
            tool_timeout: config.tool_timeout,
            http: config.http_capability(),
        }
    }
}

/// Validates, sandboxes, dry-runs and registers deployed tools.
pub struct SandboxedDeployer {
    registry: Arc<ToolRegistry>,
    runtime: Arc<WasmRuntime>,
    audit: Arc<AuditLog>,
    lock: AdminLock,
    settings: DeploySettings,
    http_client: reqwest::Client,
}

impl SandboxedDeployer {
    pub fn new(
        registry: Arc<ToolRegistry>,
        runtime: Arc<WasmRuntime>,
        audit: Arc<AuditLog>,
        lock: AdminLock,
        settings: DeploySettings,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            registry,
            runtime,
            audit,
            lock,
            settings,
            http_client,
        }
    }

    pub fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    /// Run the full pipeline and install the tool.
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployReceipt, DeployError> {
        let _admin = self.lock.acquire().await;
        let sha256 = sha256_hex(request.code.as_bytes());
        tracing::info!(name = %request.name, sha256 = %sha256, "Deploy requested");

        let result = self.admit(&request, &sha256).await;
        let entry = AuditEntry::new(AuditAction::Deploy, &request.name, AuditOutcome::Accepted)
            .with_digest_of(request.code.as_bytes());
        match result {
            Ok(receipt) => {
                self.audit
                    .record(entry.with_stage(DeployStage::Registered.as_str()))
                    .await;
                tracing::info!(
                    name = %receipt.name,
                    generation = receipt.generation,
                    replaced = receipt.replaced,
                    "Tool deployed"
                );
                Ok(receipt)
            }
            Err(rejection) => {
                let entry = AuditEntry {
                    outcome: AuditOutcome::Rejected,
                    ..entry
                };
                self.audit
                    .record(
                        entry
                            .with_stage(rejection.stage.as_str())
                            .with_code(rejection.error.code()),
                    )
                    .await;
                tracing::warn!(
                    name = %request.name,
                    stage = %rejection.stage,
                    error = %rejection.error,
                    "Deploy rejected"
                );
                Err(rejection.error)
            }
        }
    }

    /// Run every stage up to and including the dry run, without registering.
    pub async fn check(&self, request: &DeployRequest) -> Result<CheckReport, Rejection> {
        let (_, output) = self.validate(request).await?;
        Ok(CheckReport {
            name: request.name.clone(),
            stage: DeployStage::DryRun,
            sha256: sha256_hex(request.code.as_bytes()),
            dry_run_output: output,
        })
    }

    /// Remove a deployed tool. Built-ins are refused.
    pub async fn undeploy(&self, name: &str) -> Result<(), RegistryError> {
        let _admin = self.lock.acquire().await;
        let result = self.registry.unregister(name);
        let entry = match &result {
            Ok(_) => AuditEntry::new(AuditAction::Undeploy, name, AuditOutcome::Accepted),
            Err(e) => AuditEntry::new(AuditAction::Undeploy, name, AuditOutcome::Rejected)
                .with_code(e.code()),
        };
        self.audit.record(entry).await;
        result.map(|_| ())
    }

    async fn admit(&self, request: &DeployRequest, sha256: &str) -> Result<DeployReceipt, Rejection> {
        let (tool, output) = self.validate(request).await?;

        let replaced = self
            .registry
            .register(Arc::new(tool))
            .map_err(|_| {
                Rejection::at(
                    DeployStage::DryRun,
                    DeployError::NameReserved {
                        name: request.name.clone(),
                    },
                )
            })?;

        Ok(DeployReceipt {
            name: request.name.clone(),
            stage: DeployStage::Registered,
            replaced,
            sha256: sha256.to_string(),
            generation: self.registry.generation(),
            dry_run_output: output,
        })
    }

    async fn validate(
        &self,
        request: &DeployRequest,
    ) -> Result<(WasmTool, serde_json::Value), Rejection> {
        use DeployStage::*;

        if !self.settings.enabled {
            return Err(Rejection::at(Received, DeployError::Disabled));
        }
        validate_tool_name(&request.name).map_err(|e| Rejection::at(Received, e))?;
        if self.registry.is_builtin(&request.name) {
            return Err(Rejection::at(
                Received,
                DeployError::NameReserved {
                    name: request.name.clone(),
                },
            ));
        }

        let capabilities = self
            .capabilities_for(request)
            .map_err(|e| Rejection::at(Received, e))?;

        let prepared = self
            .runtime
            .prepare(request.code.as_bytes(), capabilities)
            .map_err(|e| match e {
                WasmError::Compile(reason) => {
                    Rejection::at(Received, DeployError::SyntaxInvalid { reason })
                }
                WasmError::Interface(reason) => {
                    Rejection::at(SyntaxChecked, DeployError::NotAFunction { reason })
                }
                other => Rejection::at(
                    SyntaxChecked,
                    DeployError::SandboxViolation {
                        reason: other.to_string(),
                    },
                ),
            })?;

        let description = request
            .description
            .clone()
            .unwrap_or_else(|| format!("Deployed tool '{}'", request.name));
        let tool = WasmTool::new(
            &request.name,
            description,
            Arc::clone(&self.runtime),
            prepared,
            self.settings.dry_run_timeout,
        )
        .with_http_client(self.http_client.clone());

        let input = serde_json::json!({ "args": dry_run_args(), "outputs": {} });
        let output = tool.invoke(input).await.map_err(|e| {
            Rejection::at(
                Sandboxed,
                DeployError::DryRunFailed {
                    reason: e.to_string(),
                },
            )
        })?;
        tracing::debug!(name = %request.name, "Dry run completed");

        Ok((tool.with_timeout(self.settings.tool_timeout), output))
    }

    fn capabilities_for(&self, request: &DeployRequest) -> Result<Capabilities, DeployError> {
        let mut capabilities = Capabilities::none();
        for raw in &request.capabilities {
            let kind = CapabilityKind::from_str(raw)
                .map_err(|reason| DeployError::SandboxViolation { reason })?;
            match kind {
                CapabilityKind::Http => {
                    let http = self.settings.http.clone().ok_or_else(|| {
                        DeployError::SandboxViolation {
                            reason: "http capability is not configured on this server".to_string(),
                        }
                    })?;
                    capabilities = capabilities.with_http(http);
                }
            }
        }
        Ok(capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wat;
    use crate::tools::builtin::EchoTool;
    use crate::tools::wasm::{EndpointPattern, WasmRuntimeConfig};
    use crate::tools::{ToolContext, ToolOrigin};
    use crate::plan::OutputBag;

    fn deployer(settings: DeploySettings) -> (SandboxedDeployer, Arc<ToolRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        registry.register_builtin(Arc::new(EchoTool));
        let runtime = Arc::new(WasmRuntime::new(WasmRuntimeConfig::default()).unwrap());
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
        let deployer = SandboxedDeployer::new(
            Arc::clone(&registry),
            runtime,
            audit,
            AdminLock::new(),
            settings,
        );
        (deployer, registry, dir)
    }

    fn fast() -> DeploySettings {
        DeploySettings {
            dry_run_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_valid_tool_is_registered_and_callable() {
        let (deployer, registry, _dir) = deployer(fast());
        let receipt = deployer
            .deploy(DeployRequest::new("custom.echo", wat::ECHO_TOOL))
            .await
            .unwrap();
        assert_eq!(receipt.stage, DeployStage::Registered);
        assert!(!receipt.replaced);
        assert_eq!(receipt.dry_run_output["args"], dry_run_args());

        let tool = registry.lookup("custom.echo").unwrap();
        assert_eq!(tool.origin(), ToolOrigin::Deployed);
        let bag = OutputBag::new();
        let ctx = ToolContext {
            plan_id: "p",
            step_index: 0,
            attempt: 1,
            outputs: &bag,
        };
        let out = tool.execute(serde_json::json!({"q": 1}), &ctx).await.unwrap();
        assert_eq!(out.result["args"], serde_json::json!({"q": 1}));
    }

    #[tokio::test]
    async fn test_syntax_error_never_registered() {
        let (deployer, registry, _dir) = deployer(fast());
        let err = deployer
            .deploy(DeployRequest::new("bad", wat::BROKEN_SYNTAX))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SyntaxInvalid");
        assert!(registry.lookup("bad").is_none());
    }

    #[tokio::test]
    async fn test_missing_export_is_not_a_function() {
        let (deployer, _, _dir) = deployer(fast());
        let err = deployer
            .deploy(DeployRequest::new("noexport", wat::NO_RUN_EXPORT))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotAFunction");
    }

    #[tokio::test]
    async fn test_dry_run_failures_never_registered() {
        let (deployer, registry, _dir) = deployer(fast());
        for (name, code) in [
            ("trap", wat::TRAP_TOOL),
            ("spin", wat::SPIN_TOOL),
            ("fail", wat::FAIL_TOOL),
            ("garbage", wat::GARBAGE_TOOL),
        ] {
            let err = deployer
                .deploy(DeployRequest::new(name, code))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "DryRunFailed", "{name}");
            assert!(registry.lookup(name).is_none(), "{name}");
        }
    }

    #[tokio::test]
    async fn test_failed_redeploy_keeps_previous_handler() {
        let (deployer, registry, _dir) = deployer(fast());
        deployer
            .deploy(DeployRequest::new("custom.tool", wat::OK_TOOL))
            .await
            .unwrap();
        let before = registry.generation();

        deployer
            .deploy(DeployRequest::new("custom.tool", wat::TRAP_TOOL))
            .await
            .unwrap_err();
        assert_eq!(registry.generation(), before);
        assert!(registry.lookup("custom.tool").is_some());

        let receipt = deployer
            .deploy(DeployRequest::new("custom.tool", wat::ECHO_TOOL))
            .await
            .unwrap();
        assert!(receipt.replaced);
    }

    #[tokio::test]
    async fn test_builtin_name_is_reserved() {
        let (deployer, _, _dir) = deployer(fast());
        let err = deployer
            .deploy(DeployRequest::new("echo", wat::OK_TOOL))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NameReserved");
    }

    #[tokio::test]
    async fn test_invalid_name() {
        let (deployer, _, _dir) = deployer(fast());
        let err = deployer
            .deploy(DeployRequest::new("../etc/passwd", wat::OK_TOOL))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidName");
    }

    #[tokio::test]
    async fn test_wasi_import_is_sandbox_violation() {
        let (deployer, _, _dir) = deployer(fast());
        let err = deployer
            .deploy(DeployRequest::new("escape", wat::WASI_ESCAPE))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SandboxViolation");
    }

    #[tokio::test]
    async fn test_http_import_requires_grant_and_configuration() {
        let (deployer, _, _dir) = deployer(fast());
        let err = deployer
            .deploy(DeployRequest::new("net", wat::HTTP_TOOL))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SandboxViolation");

        let err = deployer
            .deploy(DeployRequest::new("net", wat::HTTP_TOOL).with_capability("http"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SandboxViolation");

        let (deployer, registry, _dir) = self::deployer(DeploySettings {
            http: Some(HttpCapability::new(vec![EndpointPattern::host("api.weather.test")])),
            ..fast()
        });
        deployer
            .deploy(DeployRequest::new("net", wat::HTTP_TOOL).with_capability("http"))
            .await
            .unwrap();
        assert!(registry.lookup("net").is_some());
    }

    #[tokio::test]
    async fn test_disabled_deployer() {
        let (deployer, _, _dir) = deployer(DeploySettings {
            enabled: false,
            ..fast()
        });
        let err = deployer
            .deploy(DeployRequest::new("x", wat::OK_TOOL))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Disabled");
    }

    #[tokio::test]
    async fn test_every_attempt_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
        let registry = Arc::new(ToolRegistry::new());
        let deployer = SandboxedDeployer::new(
            Arc::clone(&registry),
            Arc::new(WasmRuntime::new(WasmRuntimeConfig::default()).unwrap()),
            Arc::clone(&audit),
            AdminLock::new(),
            fast(),
        );
        deployer
            .deploy(DeployRequest::new("a", wat::OK_TOOL))
            .await
            .unwrap();
        deployer
            .deploy(DeployRequest::new("b", wat::BROKEN_SYNTAX))
            .await
            .unwrap_err();
        deployer.undeploy("a").await.unwrap();

        let entries = audit.entries().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].stage.as_deref(), Some("registered"));
        assert_eq!(entries[1].code.as_deref(), Some("SyntaxInvalid"));
        assert_eq!(entries[1].stage.as_deref(), Some("received"));
        assert_eq!(entries[2].action, AuditAction::Undeploy);
        assert!(!std::fs::read_to_string(dir.path().join("audit.jsonl"))
            .unwrap()
            .contains("(module"));
    }

    #[tokio::test]
    async fn test_check_does_not_register() {
        let (deployer, registry, _dir) = deployer(fast());
        let report = deployer
            .check(&DeployRequest::new("dry", wat::OK_TOOL))
            .await
            .unwrap();
        assert_eq!(report.dry_run_output, serde_json::json!({"ok": true}));
        assert!(registry.lookup("dry").is_none());
    }
}
