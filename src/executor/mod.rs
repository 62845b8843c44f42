//! Plan execution: one step at a time, fail-fast, with every run persisted.

mod runner;
mod step;
mod store;

pub use runner::{CancelOnDrop, CancelToken, PlanRunner};
pub use step::{RetryPolicy, StepExecutor, StepOutcome};
pub use store::{FsRunStore, MemoryRunStore, RunStore};
