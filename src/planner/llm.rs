use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PlannerError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::plan::Plan;
use crate::planner::{Planner, normalize_plan};
use crate::tools::ToolRegistry;

const PLANNER_TEMPERATURE: f32 = 0.2;

const PLANNER_RULES: &str = r#"You are the orchestrator of a tool-running service.
Reply with one strict JSON object and nothing else:
{"steps":[{"tool":"<name>","args":{...},"saveAs":"<name>"}]}
Rules:
- Use only the tools listed below, with minimal and exact arguments.
- Refer to an earlier step's result with {"$ref":"<saveAs name>"}.
- Give the last useful result a saveAs name.
- Never use placeholder domains such as example.com.
- Avoid external APIs that need credentials."#;

/// Plans with a chat model in JSON mode.
pub struct LlmPlanner {
    llm: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmProvider>, registry: Arc<ToolRegistry>) -> Self {
        Self { llm, registry }
    }

    fn system_prompt(&self) -> String {
        let tools: Vec<String> = self
            .registry
            .describe()
            .into_iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        format!("{}\n\nTools:\n{}", PLANNER_RULES, tools.join("\n"))
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, instruction: &str, context: &Value) -> Result<Plan, PlannerError> {
        let plan_id = uuid::Uuid::new_v4().to_string();
        let context = if context.is_null() {
            "{}".to_string()
        } else {
            context.to_string()
        };
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(format!("Instruction: {}\nContext: {}", instruction, context)),
        ])
        .with_temperature(PLANNER_TEMPERATURE)
        .json();

        let response = self.llm.complete(request).await?;
        let raw: Value = serde_json::from_str(response.content.trim())
            .map_err(|e| PlannerError::InvalidPlan(format!("plan is not JSON: {}", e)))?;
        let plan = normalize_plan(raw, plan_id)?;
        tracing::info!(plan_id = %plan.plan_id, steps = plan.steps.len(), "Plan created");
        Ok(plan)
    }
}
