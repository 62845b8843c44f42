//! Test doubles shared by unit and integration tests.
//!
//! Provides:
//! - [`StubLlm`]: an LLM provider that returns a fixed response
//! - [`StubPlanner`]: a planner that hands back a fixed plan
//! - [`ScriptedTool`]: a tool that fails on demand and records its calls
//! - [`RecordingRestarter`]: a restarter that only counts restart requests
//! - [`wat`]: guest modules for sandbox and deploy tests
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ironplan::testing::ScriptedTool;
//!
//! let flaky = Arc::new(ScriptedTool::new("flaky").fail_times(2));
//! assert_eq!(flaky.calls(), 0);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{LlmError, PlannerError};
use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use crate::plan::Plan;
use crate::planner::Planner;
use crate::rewrite::Restarter;
use crate::tools::{Tool, ToolContext, ToolError, ToolOutput};

/// A configurable LLM provider stub.
///
/// Counts calls, remembers the last request and can be switched into a
/// failing mode at runtime with [`set_failing`](Self::set_failing).
pub struct StubLlm {
    model_name: String,
    response: String,
    call_count: AtomicU32,
    should_fail: AtomicBool,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl StubLlm {
    /// Create a new stub that returns the given response.
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            model_name: "stub-model".to_string(),
            response: response.into(),
            call_count: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
            last_request: Mutex::new(None),
        }
    }

    /// Number of times `complete` was called.
    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Toggle whether calls should fail at runtime.
    pub fn set_failing(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for StubLlm {
    fn default() -> Self {
        Self::new("OK")
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(request);
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: "server error".to_string(),
            });
        }
        Ok(CompletionResponse {
            content: self.response.clone(),
            model: self.model_name.clone(),
            input_tokens: 10,
            output_tokens: 5,
        })
    }
}

/// A planner that always returns the same steps.
///
/// The plan id is kept when set, otherwise an ad-hoc id is generated per call.
pub struct StubPlanner {
    plan: Option<Plan>,
    instructions: Mutex<Vec<String>>,
}

impl StubPlanner {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan: Some(plan),
            instructions: Mutex::new(Vec::new()),
        }
    }

    /// A planner whose every call fails as if the model were unreachable.
    pub fn unavailable() -> Self {
        Self {
            plan: None,
            instructions: Mutex::new(Vec::new()),
        }
    }

    /// Instructions received so far, oldest first.
    pub fn instructions(&self) -> Vec<String> {
        self.instructions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Planner for StubPlanner {
    async fn plan(&self, instruction: &str, _context: &Value) -> Result<Plan, PlannerError> {
        self.instructions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instruction.to_string());
        match &self.plan {
            Some(plan) => Ok(plan.clone().with_default_id()),
            None => Err(PlannerError::Llm(LlmError::RequestFailed {
                provider: "stub-planner".to_string(),
                reason: "planner unavailable".to_string(),
            })),
        }
    }
}

/// A tool with scripted failures.
///
/// On success it returns its arguments unchanged.
pub struct ScriptedTool {
    name: String,
    fail_first: u32,
    delay: Option<Duration>,
    reject_params: bool,
    calls: AtomicU32,
    last_args: Mutex<Option<Value>>,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_first: 0,
            delay: None,
            reject_params: false,
            calls: AtomicU32::new(0),
            last_args: Mutex::new(None),
        }
    }

    /// Fail the first `n` calls with a retryable error.
    pub fn fail_times(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always fail with a non-retryable `InvalidParameters`.
    pub fn reject_params(mut self) -> Self {
        self.reject_params = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_args(&self) -> Option<Value> {
        self.last_args
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test tool"
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .last_args
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(params.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_params {
            return Err(ToolError::InvalidParameters("rejected by script".to_string()));
        }
        if call <= self.fail_first {
            return Err(ToolError::ExecutionFailed(format!("scripted failure {}", call)));
        }
        Ok(ToolOutput::success(params, start.elapsed()))
    }
}

/// Counts restart requests instead of exiting.
#[derive(Default)]
pub struct RecordingRestarter {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingRestarter {
    pub fn count(&self) -> usize {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Restarter for RecordingRestarter {
    fn schedule_restart(&self, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delay);
    }
}

/// Guest modules in WebAssembly text form.
///
/// Every well-formed fixture exports `memory`, a bump `alloc` starting at
/// 4096 and `run`. Constant outputs live in data segments at 1024 and up.
pub mod wat {
    /// Returns `{"ok":true}`.
    pub const OK_TOOL: &str = r#"(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (data (i32.const 1024) "{\"ok\":true}")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    (i64.const 4398046511115)))
"#;

    /// Returns its input document (`{"args":...,"outputs":...}`) unchanged.
    pub const ECHO_TOOL: &str = r#"(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len)))))
"#;

    /// Logs a line through `host.log`, then returns `{"ok":true}`.
    pub const LOG_TOOL: &str = r#"(module
  (import "host" "log" (func $log (param i32 i32 i32)))
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (data (i32.const 1024) "{\"ok\":true}")
  (data (i32.const 2048) "hello from guest")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    (call $log (i32.const 1) (i32.const 2048) (i32.const 16))
    (i64.const 4398046511115)))
"#;

    /// Traps with `unreachable`.
    pub const TRAP_TOOL: &str = r#"(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    unreachable))
"#;

    /// Never returns.
    pub const SPIN_TOOL: &str = r#"(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    (loop $spin (br $spin))
    unreachable))
"#;

    /// Reports failure `nope` through `host.fail`.
    pub const FAIL_TOOL: &str = r#"(module
  (import "host" "fail" (func $fail (param i32 i32)))
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (data (i32.const 1024) "nope")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    (call $fail (i32.const 1024) (i32.const 4))
    unreachable))
"#;

    /// Returns the bytes `not json`.
    pub const GARBAGE_TOOL: &str = r#"(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (data (i32.const 1024) "not json")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    (i64.const 4398046511112)))
"#;

    /// Imports `host.http_fetch` but answers `{"ok":true}` without calling it.
    pub const HTTP_TOOL: &str = r#"(module
  (import "host" "http_fetch" (func $fetch (param i32 i32) (result i64)))
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (data (i32.const 1024) "{\"ok\":true}")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    (i64.const 4398046511115)))
"#;

    /// Asks for the host's stdout through WASI, which is never linked.
    pub const WASI_ESCAPE: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (data (i32.const 1024) "{\"ok\":true}")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    (i64.const 4398046511115)))
"#;

    /// Declares two pages of memory up front.
    pub const GREEDY_MEMORY: &str = r#"(module
  (memory (export "memory") 2)
  (global $next (mut i32) (i32.const 4096))
  (data (i32.const 1024) "{\"ok\":true}")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $len)))
    (local.get $ptr))
  (func (export "run") (param $ptr i32) (param $len i32) (result i64)
    (i64.const 4398046511115)))
"#;

    /// Lacks the `run` export.
    pub const NO_RUN_EXPORT: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "alloc") (param $len i32) (result i32)
    (i32.const 4096)))
"#;

    /// `run` has the wrong type.
    pub const WRONG_RUN_SIGNATURE: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "alloc") (param $len i32) (result i32)
    (i32.const 4096))
  (func (export "run") (param $ptr i32) (result i32)
    (i32.const 0)))
"#;

    /// Unbalanced parentheses.
    pub const BROKEN_SYNTAX: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "run") (param $ptr i32"#;
}
