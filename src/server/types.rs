//! Request and response DTOs for the gateway API.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Features;
use crate::deploy::{CheckReport, DeployReceipt};
use crate::error::{DeployError, PlannerError, RegistryError, RewriteError, WebhookError};
use crate::plan::{OutputBag, Plan, RunFailure, RunRecord, StepRecord};
use crate::tools::ToolInfo;

// --- Errors ---

/// The `{ ok: false, error, detail }` envelope.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
    pub detail: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            detail: detail.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized", "invalid or missing auth token")
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidRequest", detail)
    }

    pub fn not_found(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal", detail)
    }

    pub fn planner_missing() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "PlannerUnavailable",
            "no LLM provider is configured",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            ok: false,
            error: self.code,
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "InvalidRequest", rejection.body_text())
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        let status = match &err {
            DeployError::Disabled => StatusCode::FORBIDDEN,
            DeployError::InvalidName { .. } => StatusCode::BAD_REQUEST,
            DeployError::NameReserved { .. } => StatusCode::CONFLICT,
            DeployError::SyntaxInvalid { .. }
            | DeployError::NotAFunction { .. }
            | DeployError::SandboxViolation { .. }
            | DeployError::DryRunFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<RewriteError> for ApiError {
    fn from(err: RewriteError) -> Self {
        let status = match &err {
            RewriteError::Disabled => StatusCode::FORBIDDEN,
            RewriteError::Unauthorized => StatusCode::UNAUTHORIZED,
            RewriteError::SyntaxInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            RewriteError::NoBackup { .. } => StatusCode::CONFLICT,
            RewriteError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, err.code(), err.to_string())
    }
}

impl From<PlannerError> for ApiError {
    fn from(err: PlannerError) -> Self {
        let status = match &err {
            PlannerError::Llm(_) => StatusCode::SERVICE_UNAVAILABLE,
            PlannerError::InvalidPlan(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::Reserved { .. } => StatusCode::CONFLICT,
            RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

// --- Health ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub env: String,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub tools: usize,
    pub features: Features,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ok: bool,
}

// --- Planning and execution ---

#[derive(Debug, Deserialize)]
pub struct OrchestrateRequest {
    pub instruction: String,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Serialize)]
pub struct OrchestrateResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub plan: Plan,
}

/// Outcome of `/execute`. Failures keep the partial outputs and per-step evidence.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub ok: bool,
    pub plan_id: String,
    pub outputs: OutputBag,
    pub took_ms: u64,
    pub success_count: usize,
    pub fail_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub step_results: Vec<StepRecord>,
}

impl From<RunRecord> for ExecuteResponse {
    fn from(record: RunRecord) -> Self {
        Self {
            ok: record.ok,
            plan_id: record.plan_id,
            outputs: record.outputs,
            took_ms: record.duration_ms,
            success_count: record.success_count,
            fail_count: record.fail_count,
            error: record.error.as_ref().map(|f| f.code.clone()),
            detail: record.error.as_ref().map(|f| f.detail.clone()),
            failure: record.error,
            step_results: record.step_results,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLookupResponse {
    pub ok: bool,
    pub run: Value,
}

// --- Webhook ---

#[derive(Debug, Default, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub context: Value,
    /// Wait for the run and return its outputs instead of answering 202.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAccepted {
    pub ok: bool,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<ExecuteResponse>,
}

// --- Tools ---

#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub receipt: DeployReceipt,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub report: CheckReport,
}

#[derive(Debug, Serialize)]
pub struct ToolListResponse {
    pub ok: bool,
    pub generation: u64,
    pub tools: Vec<ToolInfo>,
}

#[derive(Debug, Serialize)]
pub struct UndeployResponse {
    pub ok: bool,
    pub name: String,
}

// --- Self-rewrite ---

#[derive(Debug, Deserialize)]
pub struct RewriteRequest {
    pub secret: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub secret: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteResponse {
    pub ok: bool,
    pub message: String,
    pub sha256: String,
    pub bytes: usize,
}
