//! Plan data model.
//!
//! A [`Plan`] is a flat, ordered list of [`Step`]s. Steps thread data through
//! an [`OutputBag`] scoped to a single run; the run itself is summarised in an
//! append-only [`RunRecord`].

pub mod resolver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use resolver::{REF_OBJECT_KEY, REF_PREFIX, resolve, resolve_args};

/// An ordered list of tool invocations produced by a planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(plan_id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            plan_id: plan_id.into(),
            steps,
        }
    }

    /// A plan with a generated `adhoc-<unix-ms>` id.
    pub fn adhoc(steps: Vec<Step>) -> Self {
        Self::new(adhoc_plan_id(), steps)
    }

    /// Fill in an ad-hoc id when the caller did not supply one.
    pub fn with_default_id(mut self) -> Self {
        if self.plan_id.trim().is_empty() {
            self.plan_id = adhoc_plan_id();
        }
        self
    }
}

fn adhoc_plan_id() -> String {
    format!("adhoc-{}", Utc::now().timestamp_millis())
}

/// One tool invocation within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
}

impl Step {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Map::new(),
            save_as: None,
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Replace all arguments. Non-object values are ignored.
    pub fn with_args(mut self, args: Value) -> Self {
        if let Value::Object(map) = args {
            self.args = map;
        }
        self
    }

    pub fn save_as(mut self, key: impl Into<String>) -> Self {
        self.save_as = Some(key.into());
        self
    }
}

/// Named step outputs of a single run, in insertion order.
///
/// Writing an existing key replaces its value (last write wins).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputBag(Map<String, Value>);

impl OutputBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// Outcome of one step inside a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Per-step evidence kept in the run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub index: usize,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
    pub status: StepStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub code: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Auditable summary of one plan run. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub plan_id: String,
    pub steps: Vec<Step>,
    pub outputs: OutputBag,
    pub duration_ms: u64,
    pub success_count: usize,
    pub fail_count: usize,
    pub timestamp: DateTime<Utc>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    #[serde(default)]
    pub step_results: Vec<StepRecord>,
}

impl RunRecord {
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Steps that were never attempted because an earlier step failed.
    pub fn skipped_count(&self) -> usize {
        self.step_results
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_deserializes_wire_format() {
        let plan: Plan = serde_json::from_value(json!({
            "planId": "p-1",
            "steps": [
                { "tool": "llm.generate", "args": { "prompt": "hi" }, "saveAs": "greeting" },
                { "tool": "http.fetch", "args": { "url": "https://example.test", "body": "$ref:greeting" } }
            ]
        }))
        .unwrap();

        assert_eq!(plan.plan_id, "p-1");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].save_as.as_deref(), Some("greeting"));
        assert_eq!(plan.steps[1].save_as, None);
        assert_eq!(plan.steps[1].args["body"], json!("$ref:greeting"));
    }

    #[test]
    fn test_missing_fields_default() {
        let plan: Plan = serde_json::from_value(json!({ "steps": [{ "tool": "echo" }] })).unwrap();
        assert!(plan.plan_id.is_empty());
        assert!(plan.steps[0].args.is_empty());

        let plan = plan.with_default_id();
        assert!(plan.plan_id.starts_with("adhoc-"));

        let empty: Plan = serde_json::from_value(json!({})).unwrap();
        assert!(empty.steps.is_empty());
    }

    #[test]
    fn test_output_bag_last_write_wins_and_keeps_order() {
        let mut bag = OutputBag::new();
        bag.insert("a", json!(1));
        bag.insert("b", json!(2));
        let previous = bag.insert("a", json!(3));

        assert_eq!(previous, Some(json!(1)));
        assert_eq!(bag.get("a"), Some(&json!(3)));
        assert_eq!(bag.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(serde_json::to_value(&bag).unwrap(), json!({"a": 3, "b": 2}));
    }

    #[test]
    fn test_run_record_serializes_camel_case() {
        let record = RunRecord {
            plan_id: "p".into(),
            steps: vec![Step::new("echo")],
            outputs: OutputBag::new(),
            duration_ms: 5,
            success_count: 1,
            fail_count: 0,
            timestamp: Utc::now(),
            ok: true,
            error: None,
            step_results: vec![],
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["planId"], "p");
        assert_eq!(value["durationMs"], 5);
        assert_eq!(value["successCount"], 1);
        assert!(value.get("error").is_none());
    }
}
