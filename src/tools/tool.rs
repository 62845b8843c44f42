//! Tool trait and types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::OutputBag;

/// Where a registered tool came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    /// Registered at process start. Cannot be replaced or removed.
    Builtin,
    /// Admitted at runtime through the sandboxed deployer.
    Deployed,
}

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Option<Duration>),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),
}

impl ToolError {
    /// Whether another attempt might succeed.
    ///
    /// Bad parameters and policy rejections are deterministic; everything
    /// else (timeouts, handler failures, upstream errors) is treated as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidParameters(_) | Self::NotAuthorized(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameters(_) => "InvalidParameters",
            Self::ExecutionFailed(_) => "ExecutionFailed",
            Self::Timeout(_) => "Timeout",
            Self::NotAuthorized(_) => "NotAuthorized",
            Self::RateLimited(_) => "RateLimited",
            Self::ExternalService(_) => "ExternalService",
            Self::Sandbox(_) => "Sandbox",
        }
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The result data.
    pub result: serde_json::Value,
    /// Time taken.
    pub duration: Duration,
}

impl ToolOutput {
    /// Create a successful output with a JSON result.
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    /// Create a text output.
    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }
}

/// What a handler can see about the step it is serving.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext<'a> {
    pub plan_id: &'a str,
    pub step_index: usize,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Outputs of the steps that ran before this one.
    pub outputs: &'a OutputBag,
}

/// Trait for tools a plan step can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get a description of what the tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
        })
    }

    /// Execute the tool with already-resolved arguments.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError>;

    /// Per-tool deadline. `None` means the executor's default step timeout.
    fn execution_timeout(&self) -> Option<Duration> {
        None
    }

    fn origin(&self) -> ToolOrigin {
        ToolOrigin::Builtin
    }
}

/// Extract a required string parameter from a JSON object.
///
/// Returns `ToolError::InvalidParameters` if the key is missing or not a string.
pub fn require_str<'a>(params: &'a serde_json::Value, name: &str) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", name)))
}

/// Extract a required parameter of any type from a JSON object.
pub fn require_param<'a>(
    params: &'a serde_json::Value,
    name: &str,
) -> Result<&'a serde_json::Value, ToolError> {
    params
        .get(name)
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", name)))
}
