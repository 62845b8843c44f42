//! Sequential plan execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;

use crate::error::ExecutionError;
use crate::executor::step::StepExecutor;
use crate::executor::store::RunStore;
use crate::plan::{OutputBag, Plan, RunFailure, RunRecord, StepRecord, StepStatus};

/// Caller-side abort flag, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancel when the returned guard is dropped, e.g. with the request
    /// future of a client that went away.
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop(Some(self.clone()))
    }
}

pub struct CancelOnDrop(Option<CancelToken>);

impl CancelOnDrop {
    /// Drop the guard without cancelling.
    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.0.take() {
            token.cancel();
        }
    }
}

impl From<&ExecutionError> for RunFailure {
    fn from(err: &ExecutionError) -> Self {
        let tool = match err {
            ExecutionError::UnknownTool { tool } | ExecutionError::StepFailed { tool, .. } => {
                Some(tool.clone())
            }
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            detail: err.to_string(),
            step_index: None,
            tool,
            cause: err.cause_code().map(str::to_string),
        }
    }
}

/// Drives a plan through the step executor, one step at a time.
///
/// The first failing step stops the run. Its record, and every record of a
/// step that was never attempted, is still written to the store.
pub struct PlanRunner {
    executor: StepExecutor,
    store: Arc<dyn RunStore>,
}

impl PlanRunner {
    pub fn new(executor: StepExecutor, store: Arc<dyn RunStore>) -> Self {
        Self { executor, store }
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub async fn run(&self, plan: &Plan) -> RunRecord {
        self.run_with_cancel(plan, &CancelToken::new()).await
    }

    pub async fn run_with_cancel(&self, plan: &Plan, cancel: &CancelToken) -> RunRecord {
        let start = Instant::now();
        let mut bag = OutputBag::new();
        let mut results = Vec::with_capacity(plan.steps.len());
        let mut failure: Option<RunFailure> = None;
        let mut success_count = 0;
        let mut fail_count = 0;

        tracing::info!(plan_id = %plan.plan_id, steps = plan.steps.len(), "Plan run started");

        for (index, step) in plan.steps.iter().enumerate() {
            if failure.is_some() {
                results.push(StepRecord {
                    index,
                    tool: step.tool.clone(),
                    save_as: step.save_as.clone(),
                    status: StepStatus::Skipped,
                    attempts: 0,
                    duration_ms: 0,
                    error: None,
                });
                continue;
            }

            if cancel.is_cancelled() {
                let err = ExecutionError::Cancelled {
                    completed: success_count,
                };
                tracing::info!(plan_id = %plan.plan_id, step = index, "Plan run cancelled");
                failure = Some(RunFailure {
                    step_index: Some(index),
                    ..RunFailure::from(&err)
                });
                results.push(StepRecord {
                    index,
                    tool: step.tool.clone(),
                    save_as: step.save_as.clone(),
                    status: StepStatus::Skipped,
                    attempts: 0,
                    duration_ms: 0,
                    error: None,
                });
                continue;
            }

            let step_start = Instant::now();
            match self.executor.run(&plan.plan_id, index, step, &mut bag).await {
                Ok(outcome) => {
                    success_count += 1;
                    results.push(StepRecord {
                        index,
                        tool: step.tool.clone(),
                        save_as: step.save_as.clone(),
                        status: StepStatus::Succeeded,
                        attempts: outcome.attempts,
                        duration_ms: outcome.duration.as_millis() as u64,
                        error: None,
                    });
                }
                Err(err) => {
                    fail_count += 1;
                    let attempts = match &err {
                        ExecutionError::StepFailed { attempts, .. } => *attempts,
                        _ => 0,
                    };
                    results.push(StepRecord {
                        index,
                        tool: step.tool.clone(),
                        save_as: step.save_as.clone(),
                        status: StepStatus::Failed,
                        attempts,
                        duration_ms: step_start.elapsed().as_millis() as u64,
                        error: Some(err.to_string()),
                    });
                    failure = Some(RunFailure {
                        step_index: Some(index),
                        ..RunFailure::from(&err)
                    });
                }
            }
        }

        let record = RunRecord {
            plan_id: plan.plan_id.clone(),
            steps: plan.steps.clone(),
            outputs: bag,
            duration_ms: start.elapsed().as_millis() as u64,
            success_count,
            fail_count,
            timestamp: Utc::now(),
            ok: failure.is_none(),
            error: failure,
            step_results: results,
        };

        if record.ok {
            tracing::info!(
                plan_id = %record.plan_id,
                duration_ms = record.duration_ms,
                success_count,
                "Plan run succeeded"
            );
        } else {
            tracing::warn!(
                plan_id = %record.plan_id,
                duration_ms = record.duration_ms,
                success_count,
                fail_count,
                skipped = record.skipped_count(),
                error = record.error.as_ref().map(|e| e.code.as_str()).unwrap_or_default(),
                "Plan run failed"
            );
        }

        if let Err(e) = self.store.append(&record).await {
            tracing::warn!(plan_id = %record.plan_id, error = %e, "Failed to persist run record");
        }
        record
    }
}
