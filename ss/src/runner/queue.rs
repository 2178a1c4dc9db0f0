//! Resumable task runner

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, FusedStream, StreamExt};
use futures::future;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::executor::{StepExecutor, TaskComparator};
use super::task::{FailedStep, TaskDefinition, WorkUnit};
use crate::exit::catch_recovered;

/// Errors from the task runner
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("A step batch is already running")]
    Busy,

    #[error("Invalid runner configuration: {0}")]
    Configuration(String),

    #[error("Task type '{0}' requires steps but none were given")]
    MissingSteps(String),
}

/// Outcome of one `run_step` or `retry_failed` batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub task_type: String,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct QueuedTask<T> {
    id: u64,
    task: TaskDefinition<T>,
}

struct QueueState<T> {
    tasks: Vec<QueuedTask<T>>,
    next_id: u64,
}

/// Which part of a task a batch worked on
enum BatchKind {
    Steps,
    Whole,
    Retry,
}

struct Batch<T> {
    task_id: u64,
    task_type: String,
    kind: BatchKind,
    units: Vec<(WorkUnit<T>, Option<String>)>,
}

struct RunnerInner<T> {
    executor: Arc<dyn StepExecutor<T>>,
    comparator: Option<TaskComparator<T>>,
    max_concurrent_steps: usize,
    state: Mutex<QueueState<T>>,
    running: AtomicBool,
}

/// Clears the running flag however the batch ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Task queue with bounded-concurrency step dispatch
///
/// Clones share the same queue, so a shutdown handler can read the undone
/// tasks while the owner keeps driving steps.
pub struct TaskRunner<T> {
    inner: Arc<RunnerInner<T>>,
}

impl<T> Clone for TaskRunner<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for TaskRunner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("max_concurrent_steps", &self.inner.max_concurrent_steps)
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

impl<T> TaskRunner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a runner; `max_concurrent_steps` is truncated to an integer
    pub fn new(executor: Arc<dyn StepExecutor<T>>, max_concurrent_steps: f64) -> Result<Self, RunnerError> {
        debug!(max_concurrent_steps, "TaskRunner::new: called");
        if !max_concurrent_steps.is_finite() || max_concurrent_steps.trunc() < 1.0 {
            return Err(RunnerError::Configuration(format!(
                "max-concurrent-steps must be at least 1, got {}",
                max_concurrent_steps
            )));
        }

        let comparator = executor.task_comparator();
        Ok(Self {
            inner: Arc::new(RunnerInner {
                executor,
                comparator,
                max_concurrent_steps: max_concurrent_steps.trunc() as usize,
                state: Mutex::new(QueueState {
                    tasks: Vec::new(),
                    next_id: 0,
                }),
                running: AtomicBool::new(false),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_concurrent_steps(&self) -> usize {
        self.inner.max_concurrent_steps
    }

    /// Queue a copy of `task`
    pub fn enqueue_task(&self, task: &TaskDefinition<T>) -> Result<(), RunnerError> {
        self.enqueue_task_owned(task.clone())
    }

    /// Queue `task` itself
    pub fn enqueue_task_owned(&self, task: TaskDefinition<T>) -> Result<(), RunnerError> {
        debug!(task_type = %task.task_type, steps = task.pending_steps(), "TaskRunner::enqueue_task: called");
        if self.inner.executor.requires_steps(&task.task_type) && !task.is_stepped() && !task.has_failures() {
            return Err(RunnerError::MissingSteps(task.task_type));
        }

        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.push(QueuedTask { id, task });

        if let Some(compare) = &self.inner.comparator {
            state.tasks.sort_by(|a, b| compare(&a.task, &b.task));
        }
        Ok(())
    }

    /// Whether any task has work that was never attempted
    pub fn has_undone_tasks(&self) -> bool {
        self.state().tasks.iter().any(|q| q.task.has_pending_work())
    }

    /// Pending steps across the queue, counting an undone atomic unit as one
    pub fn remaining_steps(&self) -> usize {
        self.state().tasks.iter().map(|q| q.task.remaining_units()).sum()
    }

    /// Every task still queued, including those only holding failed steps
    pub fn undone_tasks(&self) -> Vec<TaskDefinition<T>> {
        self.state().tasks.iter().map(|q| q.task.clone()).collect()
    }

    pub fn failed_steps(&self) -> usize {
        self.state().tasks.iter().map(|q| q.task.failed_count()).sum()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn ensure_idle(&self) -> Result<(), RunnerError> {
        if self.is_running() {
            debug!("TaskRunner::ensure_idle: busy");
            return Err(RunnerError::Busy);
        }
        Ok(())
    }

    fn acquire(&self) -> Result<RunningGuard<'_>, RunnerError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("TaskRunner::acquire: busy");
            return Err(RunnerError::Busy);
        }
        Ok(RunningGuard(&self.inner.running))
    }

    /// Run the next batch of the first task with pending work
    ///
    /// Returns `Ok(None)` when no pending work remains, and `Busy` while any
    /// batch is in flight.
    pub async fn run_step(&self) -> Result<Option<StepReport>, RunnerError> {
        debug!("TaskRunner::run_step: called");
        self.ensure_idle()?;
        if !self.has_undone_tasks() {
            debug!("TaskRunner::run_step: queue drained");
            return Ok(None);
        }
        let _guard = self.acquire()?;

        let Some(batch) = self.next_batch() else {
            debug!("TaskRunner::run_step: no pending work");
            return Ok(None);
        };
        Ok(Some(self.dispatch(batch).await))
    }

    /// Re-attempt failed entries of the first task that has any
    ///
    /// Returns `Ok(None)` when nothing has failed.
    pub async fn retry_failed(&self) -> Result<Option<StepReport>, RunnerError> {
        debug!("TaskRunner::retry_failed: called");
        self.ensure_idle()?;
        if self.failed_steps() == 0 {
            return Ok(None);
        }
        let _guard = self.acquire()?;

        let Some(batch) = self.next_retry() else {
            debug!("TaskRunner::retry_failed: no failed steps");
            return Ok(None);
        };
        Ok(Some(self.dispatch(batch).await))
    }

    fn next_batch(&self) -> Option<Batch<T>> {
        let state = self.state();
        let queued = state.tasks.iter().find(|q| q.task.has_pending_work())?;
        let task = &queued.task;

        let (kind, units) = match &task.steps {
            Some(steps) if !steps.is_empty() => {
                let take = steps.len().min(self.inner.max_concurrent_steps);
                let units = steps[..take].iter().map(|s| (WorkUnit::Step(s.clone()), None)).collect();
                (BatchKind::Steps, units)
            }
            _ => (BatchKind::Whole, vec![(WorkUnit::Whole, None)]),
        };

        Some(Batch {
            task_id: queued.id,
            task_type: task.task_type.clone(),
            kind,
            units,
        })
    }

    fn next_retry(&self) -> Option<Batch<T>> {
        let state = self.state();
        let queued = state.tasks.iter().find(|q| q.task.has_failures())?;
        let failed = queued.task.failed_steps.as_deref().unwrap_or_default();

        let take = failed.len().min(self.inner.max_concurrent_steps);
        let units = failed[..take]
            .iter()
            .map(|f| (f.unit(), Some(f.error.clone())))
            .collect();

        Some(Batch {
            task_id: queued.id,
            task_type: queued.task.task_type.clone(),
            kind: BatchKind::Retry,
            units,
        })
    }

    async fn dispatch(&self, batch: Batch<T>) -> StepReport {
        let dispatched = batch.units.len();
        info!(task_type = %batch.task_type, dispatched, "Dispatching steps");

        let executor = &self.inner.executor;
        let task_type = batch.task_type.as_str();

        let runs = batch.units.into_iter().map(|(unit, previous_error)| {
            let value = unit.clone().into_value();
            async move {
                let work = async {
                    match &previous_error {
                        Some(error) => executor.rerun_failed(task_type, unit, error).await,
                        None => executor.run(task_type, unit).await,
                    }
                };
                let result = match catch_recovered(work).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("{:#}", e)),
                    Err(payload) => Err(panic_message(payload)),
                };
                (value, result)
            }
        });

        let outcomes = future::join_all(runs).await;
        self.settle(batch.task_id, &batch.kind, &batch.task_type, outcomes)
    }

    /// Fold a settled batch back into its task
    fn settle(
        &self,
        task_id: u64,
        kind: &BatchKind,
        task_type: &str,
        outcomes: Vec<(Option<T>, Result<(), String>)>,
    ) -> StepReport {
        let dispatched = outcomes.len();
        let mut state = self.state();

        let Some(index) = state.tasks.iter().position(|q| q.id == task_id) else {
            warn!(%task_type, "Task left the queue while its steps were running");
            let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
            return StepReport {
                task_type: task_type.to_string(),
                dispatched,
                completed: dispatched - failed,
                failed,
            };
        };

        let task = &mut state.tasks[index].task;
        match kind {
            BatchKind::Steps => {
                if let Some(steps) = task.steps.as_mut() {
                    steps.drain(..dispatched.min(steps.len()));
                }
            }
            BatchKind::Retry => {
                if let Some(failed) = task.failed_steps.as_mut() {
                    failed.drain(..dispatched.min(failed.len()));
                }
            }
            BatchKind::Whole => {}
        }

        let mut failed = 0;
        for (value, result) in outcomes {
            if let Err(error) = result {
                warn!(%task_type, %error, "Step failed");
                failed += 1;
                task.record_failure(FailedStep::new(error, value));
            }
        }

        if !task.is_stepped() && !task.has_failures() {
            debug!(%task_type, "TaskRunner::settle: task finished, removing");
            state.tasks.remove(index);
        }

        StepReport {
            task_type: task_type.to_string(),
            dispatched,
            completed: dispatched - failed,
            failed,
        }
    }

    /// Stream of `run_step` results until no pending work remains
    ///
    /// Stops after the first error. Each call starts a new stream over the
    /// shared queue.
    pub fn as_runnable_stream(&self) -> impl FusedStream<Item = Result<StepReport, RunnerError>> + Send + 'static {
        stream::unfold(Some(self.clone()), |runner| async move {
            let runner = runner?;
            match runner.run_step().await {
                Ok(Some(report)) => Some((Ok(report), Some(runner))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .fuse()
    }
}
