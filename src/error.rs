//! Error types for ironplan.
//!
//! Every error that reaches a caller carries a stable machine-readable code
//! (see `code()`), used verbatim in the `{ ok: false, error, detail }` envelope.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::tools::ToolError;

/// Configuration errors raised while resolving the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Registry mutations that would break the built-in/deployed split.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("'{name}' is a built-in tool")]
    Reserved { name: String },

    #[error("no tool named '{name}'")]
    NotFound { name: String },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Reserved { .. } => "NameReserved",
            Self::NotFound { .. } => "UnknownTool",
        }
    }
}

/// Failures of a single step or of a whole plan run.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The step names a tool that is not registered. Never retried.
    #[error("unknown tool '{tool}'")]
    UnknownTool { tool: String },

    /// A `$ref` points at an output-bag key no earlier step produced. Never retried.
    #[error("unresolved reference '{key}'")]
    UnresolvedReference { key: String },

    /// The handler kept failing after the retry budget was spent.
    #[error("step '{tool}' failed after {attempts} attempt(s): {cause}")]
    StepFailed {
        tool: String,
        attempts: u32,
        cause: ToolError,
    },

    /// The caller cancelled the run between steps.
    #[error("run cancelled after {completed} completed step(s)")]
    Cancelled { completed: usize },
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTool { .. } => "UnknownTool",
            Self::UnresolvedReference { .. } => "UnresolvedReference",
            Self::StepFailed { .. } => "StepFailed",
            Self::Cancelled { .. } => "Cancelled",
        }
    }

    /// Code of the underlying cause (`Timeout` for timed-out handlers).
    pub fn cause_code(&self) -> Option<&'static str> {
        match self {
            Self::StepFailed { cause, .. } => Some(cause.code()),
            _ => None,
        }
    }
}

/// Errors raised by the WASM sandbox runtime.
#[derive(Debug, Error)]
pub enum WasmError {
    #[error("module failed to compile: {0}")]
    Compile(String),

    #[error("module does not expose the tool interface: {0}")]
    Interface(String),

    #[error("capability not granted: {0}")]
    Capability(String),

    #[error("instantiation failed: {0}")]
    Instantiate(String),

    #[error("guest trapped: {0}")]
    Trap(String),

    #[error("guest exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("guest reported failure: {0}")]
    Guest(String),

    #[error("guest produced invalid output: {0}")]
    Output(String),
}

/// Rejection reasons for a tool deployment. All are terminal for the attempt.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("tool deployment is disabled")]
    Disabled,

    #[error("invalid tool name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("'{name}' is a built-in tool and cannot be replaced")]
    NameReserved { name: String },

    #[error("code does not parse: {reason}")]
    SyntaxInvalid { reason: String },

    #[error("code does not export a callable tool: {reason}")]
    NotAFunction { reason: String },

    #[error("code requests capabilities outside the sandbox: {reason}")]
    SandboxViolation { reason: String },

    #[error("dry run failed: {reason}")]
    DryRunFailed { reason: String },
}

impl DeployError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::InvalidName { .. } => "InvalidName",
            Self::NameReserved { .. } => "NameReserved",
            Self::SyntaxInvalid { .. } => "SyntaxInvalid",
            Self::NotAFunction { .. } => "NotAFunction",
            Self::SandboxViolation { .. } => "SandboxViolation",
            Self::DryRunFailed { .. } => "DryRunFailed",
        }
    }
}

/// Self-rewrite and rollback failures. Never retried.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("self-rewrite is not configured")]
    Disabled,

    #[error("invalid rewrite credential")]
    Unauthorized,

    #[error("new source does not parse: {reason}")]
    SyntaxInvalid { reason: String },

    #[error("no backup available at {}", path.display())]
    NoBackup { path: PathBuf },

    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RewriteError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::Unauthorized => "Unauthorized",
            Self::SyntaxInvalid { .. } => "SyntaxInvalid",
            Self::NoBackup { .. } => "NoBackup",
            Self::Io { .. } => "RewriteIOError",
        }
    }

    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Webhook authentication failures. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing or malformed timestamp header")]
    MissingTimestamp,

    #[error("timestamp is {drift_ms} ms away from server time")]
    StaleTimestamp { drift_ms: i64 },

    #[error("missing signature header")]
    MissingSignature,

    #[error("signature does not match")]
    BadSignature,
}

impl WebhookError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingTimestamp | Self::StaleTimestamp { .. } => "StaleTimestamp",
            Self::MissingSignature | Self::BadSignature => "BadSignature",
        }
    }
}

/// LLM provider errors.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM is not configured (set OPENAI_API_KEY)")]
    NotConfigured,

    #[error("{provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("{provider} rejected the API key")]
    AuthFailed { provider: String },

    #[error("{provider} rate limited the request")]
    RateLimited { provider: String },

    #[error("{provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Errors from turning an instruction into a plan.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("planner returned an invalid plan: {0}")]
    InvalidPlan(String),
}

impl PlannerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Llm(_) => "PlannerUnavailable",
            Self::InvalidPlan(_) => "InvalidPlan",
        }
    }
}

/// Run-record persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
