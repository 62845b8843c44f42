//! Turning an instruction into a plan.
//!
//! Plan content is non-deterministic and outside the executor's contract;
//! only its shape is checked here. Tests always use a stub planner.

mod llm;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PlannerError;
use crate::plan::{Plan, Step};

pub use llm::LlmPlanner;

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, instruction: &str, context: &Value) -> Result<Plan, PlannerError>;
}

/// Coerce a planner's raw JSON into a [`Plan`] under `plan_id`.
///
/// The planner's own `planId` is ignored. A missing or non-array `steps`
/// becomes an empty plan; a step without a string `tool` rejects the plan.
pub fn normalize_plan(raw: Value, plan_id: impl Into<String>) -> Result<Plan, PlannerError> {
    let Value::Object(mut object) = raw else {
        return Err(PlannerError::InvalidPlan(
            "planner output is not a JSON object".to_string(),
        ));
    };

    let steps = match object.remove("steps") {
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| parse_step(i, item))
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };
    Ok(Plan::new(plan_id, steps))
}

fn parse_step(index: usize, item: Value) -> Result<Step, PlannerError> {
    let Value::Object(mut object) = item else {
        return Err(PlannerError::InvalidPlan(format!(
            "step {} is not an object",
            index
        )));
    };
    let tool = match object.remove("tool") {
        Some(Value::String(tool)) if !tool.trim().is_empty() => tool,
        _ => {
            return Err(PlannerError::InvalidPlan(format!(
                "step {} has no tool name",
                index
            )));
        }
    };
    let mut step = Step::new(tool);
    if let Some(args) = object.remove("args") {
        step = step.with_args(args);
    }
    if let Some(Value::String(key)) = object.remove("saveAs")
        && !key.is_empty()
    {
        step = step.save_as(key);
    }
    Ok(step)
}
