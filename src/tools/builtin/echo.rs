//! Echo tool for diagnostics.

use std::time::Instant;

use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput};

/// Returns its arguments unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the arguments unchanged. Useful for testing plans and $ref wiring."
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
        _ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        Ok(ToolOutput::success(params, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::OutputBag;

    #[tokio::test]
    async fn test_echo_returns_args() {
        let bag = OutputBag::new();
        let ctx = ToolContext {
            plan_id: "p",
            step_index: 0,
            attempt: 1,
            outputs: &bag,
        };
        let args = serde_json::json!({"message": "hi", "n": [1, 2]});
        let out = EchoTool.execute(args.clone(), &ctx).await.unwrap();
        assert_eq!(out.result, args);
    }
}
