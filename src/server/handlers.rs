//! Route handlers.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::deploy::DeployRequest;
use crate::executor::CancelToken;
use crate::plan::{Plan, RunRecord};
use crate::server::AppState;
use crate::server::types::*;
use crate::webhook::{SIGNATURE_HEADER, TIMESTAMP_HEADER};

const WEBHOOK_DEFAULT_INSTRUCTION: &str = "webhook-triggered";

// --- Health ---

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        env: state.env.clone(),
        version: crate::VERSION,
        uptime_secs: state.started_at.elapsed().as_secs(),
        tools: state.registry.count(),
        features: state.features,
    })
}

pub async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    if state.registry.count() == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(ReadyResponse { ok: false })).into_response();
    }
    Json(ReadyResponse { ok: true }).into_response()
}

// --- Planning and execution ---

pub async fn orchestrate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<OrchestrateRequest>, JsonRejection>,
) -> ApiResult<OrchestrateResponse> {
    let Json(req) = payload?;
    let planner = state.planner.as_ref().ok_or_else(ApiError::planner_missing)?;
    let plan = planner.plan(&req.instruction, &req.context).await?;
    Ok(Json(OrchestrateResponse { ok: true, plan }))
}

pub async fn execute(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Plan>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(plan) = payload?;
    let record = run_detached(&state, plan.with_default_id()).await?;
    let status = if record.ok {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(ExecuteResponse::from(record))).into_response())
}

/// Run on a separate task so a client disconnect stops the plan between
/// steps instead of dropping a handler mid-call.
async fn run_detached(state: &AppState, plan: Plan) -> Result<RunRecord, ApiError> {
    let cancel = CancelToken::new();
    let guard = cancel.drop_guard();
    let runner = Arc::clone(&state.runner);
    let record = tokio::spawn(async move { runner.run_with_cancel(&plan, &cancel).await })
        .await
        .map_err(|e| ApiError::internal(format!("plan task failed: {}", e)))?;
    guard.disarm();
    Ok(record)
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(plan_id): Path<String>,
) -> ApiResult<RunLookupResponse> {
    let run = state
        .runner
        .store()
        .latest(&plan_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("NotFound", format!("no run for plan '{}'", plan_id)))?;
    Ok(Json(RunLookupResponse { ok: true, run }))
}

// --- Webhook ---

pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Err(e) = state
        .webhook
        .verify(&body, header(SIGNATURE_HEADER), header(TIMESTAMP_HEADER))
    {
        tracing::warn!(error = %e, "Rejected webhook");
        return Err(e.into());
    }

    let req: WebhookRequest = if body.iter().all(u8::is_ascii_whitespace) {
        WebhookRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid webhook body: {}", e)))?
    };
    let planner = state.planner.as_ref().ok_or_else(ApiError::planner_missing)?;
    let instruction = req
        .instruction
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(WEBHOOK_DEFAULT_INSTRUCTION);
    let plan = planner.plan(instruction, &req.context).await?;
    let plan_id = plan.plan_id.clone();
    tracing::info!(plan_id = %plan_id, wait = req.wait, "Webhook accepted");

    if req.wait {
        let record = run_detached(&state, plan).await?;
        return Ok(Json(WebhookAccepted {
            ok: record.ok,
            plan_id,
            out: Some(record.into()),
        })
        .into_response());
    }

    let runner = Arc::clone(&state.runner);
    tokio::spawn(async move {
        runner.run(&plan).await;
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            ok: true,
            plan_id,
            out: None,
        }),
    )
        .into_response())
}

// --- Tools ---

pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        ok: true,
        generation: state.registry.generation(),
        tools: state.registry.describe(),
    })
}

pub async fn deploy(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> ApiResult<DeployResponse> {
    let Json(req) = payload?;
    let receipt = state.deployer.deploy(req).await?;
    Ok(Json(DeployResponse { ok: true, receipt }))
}

pub async fn check_deploy(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> ApiResult<CheckResponse> {
    let Json(req) = payload?;
    let report = state
        .deployer
        .check(&req)
        .await
        .map_err(|rejection| ApiError::from(rejection.error))?;
    Ok(Json(CheckResponse { ok: true, report }))
}

pub async fn undeploy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<UndeployResponse> {
    state.deployer.undeploy(&name).await?;
    Ok(Json(UndeployResponse { ok: true, name }))
}

// --- Self-rewrite ---

pub async fn rewrite(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RewriteRequest>, JsonRejection>,
) -> ApiResult<RewriteResponse> {
    let Json(req) = payload?;
    let outcome = state.rewrite.rewrite(&req.secret, &req.code).await?;
    Ok(Json(RewriteResponse {
        ok: true,
        message: outcome.message,
        sha256: outcome.sha256,
        bytes: outcome.bytes,
    }))
}

pub async fn rollback(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RollbackRequest>, JsonRejection>,
) -> ApiResult<RewriteResponse> {
    let Json(req) = payload?;
    let outcome = state.rewrite.rollback(&req.secret).await?;
    Ok(Json(RewriteResponse {
        ok: true,
        message: outcome.message,
        sha256: outcome.sha256,
        bytes: outcome.bytes,
    }))
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("NotFound", "no such route")
}
