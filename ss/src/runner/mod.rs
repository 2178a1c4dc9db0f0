//! Resumable task runner
//!
//! Tasks are queued as [`TaskDefinition`]s and driven a batch at a time by
//! [`TaskRunner::run_step`]. Failed steps are kept on the task so the whole
//! queue, failures included, can be persisted and resumed.

mod executor;
mod queue;
mod task;

pub use executor::{ExecutorRegistry, StepExecutor, TaskComparator, TaskHandler};
pub use queue::{RunnerError, StepReport, TaskRunner};
pub use task::{FailedStep, TaskDefinition, WorkUnit};

#[cfg(test)]
pub(crate) use executor::mock as executor_mock;
