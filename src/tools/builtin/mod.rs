//! Built-in tools registered at startup.

mod echo;
mod http;
mod llm;

use std::sync::Arc;

pub use echo::EchoTool;
pub use http::HttpFetchTool;
pub use llm::LlmGenerateTool;

use crate::llm::LlmProvider;
use crate::tools::ToolRegistry;

/// Register every built-in. `llm.generate` is only available with a provider.
pub fn register_builtins(registry: &ToolRegistry, llm: Option<Arc<dyn LlmProvider>>) {
    registry.register_builtin(Arc::new(EchoTool));
    registry.register_builtin(Arc::new(HttpFetchTool::new()));
    if let Some(llm) = llm {
        registry.register_builtin(Arc::new(LlmGenerateTool::new(llm)));
    }
    tracing::info!(tools = ?registry.list(), "Registered built-in tools");
}
