//! Single-step execution: lookup, resolution, timeout and retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ExecutionError;
use crate::plan::{OutputBag, Step, resolve_args};
use crate::tools::{ToolContext, ToolError, ToolRegistry};

/// Bounded retry with linear backoff (`backoff_base * attempt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Pause after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt)
    }
}

/// A successful step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub value: serde_json::Value,
    pub attempts: u32,
    pub duration: Duration,
}

/// Runs one step against the registry.
#[derive(Clone)]
pub struct StepExecutor {
    registry: Arc<ToolRegistry>,
    default_timeout: Duration,
    retry: RetryPolicy,
}

impl StepExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            default_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Execute `step`, writing its result to `bag` under `saveAs` on success.
    ///
    /// Unknown tools and unresolved references fail immediately. Handler
    /// failures are retried while they are retryable and attempts remain.
    pub async fn run(
        &self,
        plan_id: &str,
        index: usize,
        step: &Step,
        bag: &mut OutputBag,
    ) -> Result<StepOutcome, ExecutionError> {
        let start = Instant::now();

        // The handle stays valid for the whole step even if the registry changes meanwhile.
        let tool = self
            .registry
            .lookup(&step.tool)
            .ok_or_else(|| ExecutionError::UnknownTool {
                tool: step.tool.clone(),
            })?;
        let args = serde_json::Value::Object(resolve_args(&step.args, bag)?);
        let timeout = tool.execution_timeout().unwrap_or(self.default_timeout);
        let max_attempts = self.retry.max_attempts();

        let mut attempt = 1;
        let value = loop {
            let ctx = ToolContext {
                plan_id,
                step_index: index,
                attempt,
                outputs: &*bag,
            };
            let result = match tokio::time::timeout(timeout, tool.execute(args.clone(), &ctx)).await
            {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(timeout)),
            };

            match result {
                Ok(output) => break output.result,
                Err(cause) if cause.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        plan_id,
                        step = index,
                        tool = %step.tool,
                        attempt,
                        error = %cause,
                        ?delay,
                        "Step attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(cause) => {
                    tracing::warn!(
                        plan_id,
                        step = index,
                        tool = %step.tool,
                        attempts = attempt,
                        error = %cause,
                        "Step failed"
                    );
                    return Err(ExecutionError::StepFailed {
                        tool: step.tool.clone(),
                        attempts: attempt,
                        cause,
                    });
                }
            }
        };

        if let Some(key) = &step.save_as {
            bag.insert(key.clone(), value.clone());
        }

        let duration = start.elapsed();
        tracing::debug!(
            plan_id,
            step = index,
            tool = %step.tool,
            attempts = attempt,
            duration_ms = duration.as_millis() as u64,
            "Step succeeded"
        );
        Ok(StepOutcome {
            value,
            attempts: attempt,
            duration,
        })
    }
}
