//! Progress persistence across restarts
//!
//! Ties the task runner to the snapshot store: the queue is saved by a
//! shutdown handler and consumed again on the next start.

use std::sync::Arc;

use progressstore::{ProgressError, ProgressStore};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

use crate::exit::{ExitError, ExitHandler, HandlerId};
use crate::runner::{RunnerError, StepExecutor, TaskDefinition, TaskRunner};

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Save the runner's undone tasks when the process shuts down
///
/// The handler lifts the exit timeout while it writes, so a slow disk cannot
/// get the process killed halfway through, and restores it afterwards
/// whether or not the write succeeded. An empty queue removes any stale
/// snapshot instead of writing an empty one.
pub fn bind_progress_saver<T>(
    exit: &ExitHandler,
    runner: &TaskRunner<T>,
    store: ProgressStore,
) -> Result<HandlerId, ExitError>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    debug!(path = ?store.path(), "bind_progress_saver: called");
    let handler_exit = exit.clone();
    let runner = runner.clone();

    exit.bind(move || {
        let exit = handler_exit.clone();
        let runner = runner.clone();
        let store = store.clone();
        async move {
            let timeout_was_enabled = exit.exit_timeout_enabled();
            exit.disable_exit_timeout();
            let tasks = runner.undone_tasks();

            let result = if tasks.is_empty() {
                debug!("bind_progress_saver: queue drained, discarding snapshot");
                store.discard().await.map(|_| ())
            } else {
                info!(tasks = tasks.len(), path = ?store.path(), "Saving undone tasks");
                store.save(&tasks).await
            };

            if timeout_was_enabled {
                exit.enable_exit_timeout();
            }
            result?;
            Ok(())
        }
    })
}

/// Build a runner seeded from the last snapshot, consuming it
pub async fn resume_runner<T>(
    store: &ProgressStore,
    executor: Arc<dyn StepExecutor<T>>,
    max_concurrent_steps: f64,
) -> Result<TaskRunner<T>, ResumeError>
where
    T: Clone + DeserializeOwned + Send + Sync + 'static,
{
    debug!(path = ?store.path(), "resume_runner: called");
    let runner = TaskRunner::new(executor, max_concurrent_steps)?;

    let tasks: Vec<TaskDefinition<T>> = match store.load_and_clear().await {
        Ok(tasks) => tasks,
        Err(e) if e.is_missing() => {
            debug!("resume_runner: no snapshot, starting empty");
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };

    if !tasks.is_empty() {
        info!(tasks = tasks.len(), "Resuming tasks from snapshot");
    }
    for task in tasks {
        runner.enqueue_task_owned(task)?;
    }
    Ok(runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::{ExitConfig, ExitOutcome, Terminator};
    use crate::runner::executor_mock::MockExecutor;
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoopTerminator;

    impl Terminator for NoopTerminator {
        fn exit(&self, _code: i32) {}
        fn kill(&self) {}
    }

    fn test_exit() -> ExitHandler {
        let config = ExitConfig {
            handle_signals: false,
            ..Default::default()
        };
        ExitHandler::with_terminator(&config, Arc::new(NoopTerminator))
    }

    fn store(temp: &TempDir) -> ProgressStore {
        ProgressStore::new(temp.path().join("state").join("progress.json"))
    }

    #[tokio::test]
    async fn test_shutdown_saves_undone_tasks() {
        let temp = TempDir::new().unwrap();
        let exit = test_exit();
        let runner = TaskRunner::new(Arc::new(MockExecutor::default()), 2.0).unwrap();
        runner
            .enqueue_task(&TaskDefinition::with_steps("x", vec![1, 2, 3]))
            .unwrap();
        runner.run_step().await.unwrap();

        bind_progress_saver(&exit, &runner, store(&temp)).unwrap();
        assert_eq!(exit.exit_gracefully(0).await, ExitOutcome::Exited(0));

        assert!(exit.exit_timeout_enabled());
        let saved: Vec<TaskDefinition<u32>> = store(&temp).peek().await.unwrap();
        assert_eq!(saved, vec![TaskDefinition::with_steps("x", vec![3])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_after_saver_stay_bounded() {
        let temp = TempDir::new().unwrap();
        let exit = test_exit();
        let runner = TaskRunner::new(Arc::new(MockExecutor::default()), 2.0).unwrap();
        runner
            .enqueue_task(&TaskDefinition::with_steps("x", vec![1]))
            .unwrap();

        bind_progress_saver(&exit, &runner, store(&temp)).unwrap();
        exit.bind(|| futures::future::pending()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(3600), exit.exit_gracefully(0)).await;

        assert_eq!(outcome.unwrap(), ExitOutcome::ForceKilled);
        assert!(store(&temp).exists().await);
    }

    #[tokio::test]
    async fn test_empty_queue_discards_stale_snapshot() {
        let temp = TempDir::new().unwrap();
        store(&temp)
            .save(&[TaskDefinition::<u32>::whole("stale")])
            .await
            .unwrap();

        let exit = test_exit();
        let runner: TaskRunner<u32> = TaskRunner::new(Arc::new(MockExecutor::default()), 1.0).unwrap();
        bind_progress_saver(&exit, &runner, store(&temp)).unwrap();
        exit.exit_gracefully(0).await;

        assert!(!store(&temp).exists().await);
    }

    #[tokio::test]
    async fn test_resume_consumes_snapshot() {
        let temp = TempDir::new().unwrap();
        let mut failed = TaskDefinition::with_steps("x", vec![]);
        failed.failed_steps = Some(vec![crate::runner::FailedStep::new("timeout", Some(9))]);
        let snapshot = vec![TaskDefinition::with_steps("x", vec![4, 5]), failed];
        store(&temp).save(&snapshot).await.unwrap();

        let runner: TaskRunner<u32> = resume_runner(&store(&temp), Arc::new(MockExecutor::default()), 2.0)
            .await
            .unwrap();

        assert_eq!(runner.undone_tasks(), snapshot);
        assert_eq!(runner.remaining_steps(), 2);
        assert!(!store(&temp).exists().await);
    }

    #[tokio::test]
    async fn test_resume_without_snapshot_starts_empty() {
        let temp = TempDir::new().unwrap();
        let runner: TaskRunner<u32> = resume_runner(&store(&temp), Arc::new(MockExecutor::default()), 2.0)
            .await
            .unwrap();
        assert!(runner.undone_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_resume_surfaces_corrupt_snapshot() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("progress.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let result: Result<TaskRunner<u32>, _> =
            resume_runner(&store(&temp), Arc::new(MockExecutor::default()), 2.0).await;

        assert!(matches!(result, Err(ResumeError::Progress(ProgressError::Corrupt { .. }))));
        assert!(path.exists());
    }
}
