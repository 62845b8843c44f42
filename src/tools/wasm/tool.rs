//! Deployed tools backed by a sandboxed guest module.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::WasmError;
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOrigin, ToolOutput};
use crate::tools::wasm::host::HostHttp;
use crate::tools::wasm::runtime::{PreparedModule, WasmRuntime};

/// A tool whose handler is a guest module.
pub struct WasmTool {
    name: String,
    description: String,
    runtime: Arc<WasmRuntime>,
    module: PreparedModule,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for WasmTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl WasmTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        runtime: Arc<WasmRuntime>,
        module: PreparedModule,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            runtime,
            module,
            timeout,
            http_client: reqwest::Client::new(),
        }
    }

    /// Use `client` for the guest's `http_fetch` calls.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = client;
        self
    }

    /// Same guest, different deadline. Used for the deploy dry run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the guest with `input` on a blocking thread.
    pub async fn invoke(&self, input: serde_json::Value) -> Result<serde_json::Value, WasmError> {
        let http = self
            .module
            .capabilities()
            .http
            .clone()
            .map(|capability| HostHttp {
                client: self.http_client.clone(),
                handle: tokio::runtime::Handle::current(),
                capability,
            });
        let runtime = Arc::clone(&self.runtime);
        let module = self.module.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || runtime.invoke(&module, &input, timeout, http))
            .await
            .map_err(|e| WasmError::Trap(format!("guest thread failed: {}", e)))?
    }
}

impl From<WasmError> for ToolError {
    fn from(err: WasmError) -> Self {
        match err {
            WasmError::Timeout(d) => ToolError::Timeout(d),
            WasmError::Guest(msg) => ToolError::ExecutionFailed(msg),
            WasmError::Trap(msg) | WasmError::Output(msg) => {
                ToolError::ExecutionFailed(format!("guest error: {}", msg))
            }
            other => ToolError::Sandbox(other.to_string()),
        }
    }
}

#[async_trait]
impl Tool for WasmTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "additionalProperties": true,
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let input = serde_json::json!({
            "args": params,
            "outputs": ctx.outputs,
        });
        let result = self.invoke(input).await?;
        Ok(ToolOutput::success(result, start.elapsed()))
    }

    fn execution_timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn origin(&self) -> ToolOrigin {
        ToolOrigin::Deployed
    }
}
