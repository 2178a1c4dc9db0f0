//! Step execution
//!
//! The runner never knows what a step does. It hands each unit to a
//! [`StepExecutor`], which for the service is an [`ExecutorRegistry`] that
//! dispatches on the task type to a registered [`TaskHandler`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::eyre;
use tracing::debug;

use super::task::{TaskDefinition, WorkUnit};

/// Orders the task queue; applied as a stable sort after every insertion
pub type TaskComparator<T> = Arc<dyn Fn(&TaskDefinition<T>, &TaskDefinition<T>) -> Ordering + Send + Sync>;

/// Runs the units of queued tasks
#[async_trait]
pub trait StepExecutor<T: Send + 'static>: Send + Sync {
    /// Run one step, or the whole task when `unit` is `WorkUnit::Whole`
    async fn run(&self, task_type: &str, unit: WorkUnit<T>) -> eyre::Result<()>;

    /// Re-attempt a unit that failed with `error`
    async fn rerun_failed(&self, task_type: &str, unit: WorkUnit<T>, error: &str) -> eyre::Result<()> {
        debug!(%task_type, %error, "StepExecutor::rerun_failed: called");
        self.run(task_type, unit).await
    }

    /// Whether tasks of this type must carry discrete steps
    fn requires_steps(&self, _task_type: &str) -> bool {
        false
    }

    /// Queue ordering, if the executor wants one
    fn task_comparator(&self) -> Option<TaskComparator<T>> {
        None
    }
}

/// Handler for one task type
#[async_trait]
pub trait TaskHandler<T: Send + 'static>: Send + Sync {
    /// Task type identifier this handler serves
    fn task_type(&self) -> &str;

    async fn run(&self, unit: WorkUnit<T>) -> eyre::Result<()>;

    async fn rerun_failed(&self, unit: WorkUnit<T>, error: &str) -> eyre::Result<()> {
        debug!(task_type = %self.task_type(), %error, "TaskHandler::rerun_failed: called");
        self.run(unit).await
    }

    fn requires_steps(&self) -> bool {
        false
    }
}

/// Executor dispatching on task type
pub struct ExecutorRegistry<T> {
    handlers: HashMap<String, Box<dyn TaskHandler<T>>>,
    comparator: Option<TaskComparator<T>>,
}

impl<T: Send + 'static> ExecutorRegistry<T> {
    pub fn new() -> Self {
        debug!("ExecutorRegistry::new: called");
        Self {
            handlers: HashMap::new(),
            comparator: None,
        }
    }

    /// Add a handler, replacing any previous handler for the same type
    pub fn register(&mut self, handler: Box<dyn TaskHandler<T>>) -> &mut Self {
        debug!(task_type = %handler.task_type(), "ExecutorRegistry::register: called");
        self.handlers.insert(handler.task_type().to_string(), handler);
        self
    }

    /// Order the queue with `comparator`
    pub fn with_comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&TaskDefinition<T>, &TaskDefinition<T>) -> Ordering + Send + Sync + 'static,
    {
        self.comparator = Some(Arc::new(comparator));
        self
    }

    /// Order the queue by task type, in the order given; unknown types go last
    pub fn with_type_priority(self, order: &[&str]) -> Self {
        let rank: HashMap<String, usize> = order.iter().enumerate().map(|(i, t)| (t.to_string(), i)).collect();
        self.with_comparator(move |a, b| {
            let ra = rank.get(&a.task_type).copied().unwrap_or(usize::MAX);
            let rb = rank.get(&b.task_type).copied().unwrap_or(usize::MAX);
            ra.cmp(&rb)
        })
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl<T: Send + 'static> Default for ExecutorRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> StepExecutor<T> for ExecutorRegistry<T> {
    async fn run(&self, task_type: &str, unit: WorkUnit<T>) -> eyre::Result<()> {
        debug!(%task_type, "ExecutorRegistry::run: called");
        match self.handlers.get(task_type) {
            Some(handler) => handler.run(unit).await,
            None => {
                debug!(%task_type, "ExecutorRegistry::run: unknown task type");
                Err(eyre!("Unknown task type: {}", task_type))
            }
        }
    }

    async fn rerun_failed(&self, task_type: &str, unit: WorkUnit<T>, error: &str) -> eyre::Result<()> {
        debug!(%task_type, "ExecutorRegistry::rerun_failed: called");
        match self.handlers.get(task_type) {
            Some(handler) => handler.rerun_failed(unit, error).await,
            None => Err(eyre!("Unknown task type: {}", task_type)),
        }
    }

    fn requires_steps(&self, task_type: &str) -> bool {
        self.handlers.get(task_type).is_some_and(|h| h.requires_steps())
    }

    fn task_comparator(&self) -> Option<TaskComparator<T>> {
        self.comparator.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        seen: Arc<Mutex<Vec<Option<u32>>>>,
        stepped: bool,
    }

    #[async_trait]
    impl TaskHandler<u32> for Recording {
        fn task_type(&self) -> &str {
            self.name
        }

        async fn run(&self, unit: WorkUnit<u32>) -> eyre::Result<()> {
            self.seen.lock().unwrap().push(unit.into_value());
            Ok(())
        }

        fn requires_steps(&self) -> bool {
            self.stepped
        }
    }

    fn registry(seen: &Arc<Mutex<Vec<Option<u32>>>>) -> ExecutorRegistry<u32> {
        let mut registry = ExecutorRegistry::new();
        registry
            .register(Box::new(Recording {
                name: "calendar-sync",
                seen: seen.clone(),
                stepped: true,
            }))
            .register(Box::new(Recording {
                name: "cleanup",
                seen: seen.clone(),
                stepped: false,
            }));
        registry
    }

    #[tokio::test]
    async fn test_dispatches_by_task_type() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&seen);

        registry.run("calendar-sync", WorkUnit::Step(7)).await.unwrap();
        registry.run("cleanup", WorkUnit::Whole).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Some(7), None]);
    }

    #[tokio::test]
    async fn test_unknown_task_type_fails_the_unit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&seen);

        let err = registry.run("mail", WorkUnit::Whole).await.unwrap_err();
        assert!(err.to_string().contains("Unknown task type"));
        assert!(registry.rerun_failed("mail", WorkUnit::Whole, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_rerun_defaults_to_run() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&seen);

        registry
            .rerun_failed("calendar-sync", WorkUnit::Step(3), "timeout")
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some(3)]);
    }

    #[test]
    fn test_requires_steps_per_type() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&seen);

        assert!(registry.requires_steps("calendar-sync"));
        assert!(!registry.requires_steps("cleanup"));
        assert!(!registry.requires_steps("mail"));
    }

    #[test]
    fn test_type_priority_comparator() {
        let registry: ExecutorRegistry<u32> = ExecutorRegistry::new().with_type_priority(&["groups", "calendar-sync"]);
        let compare = registry.task_comparator().unwrap();

        let groups = TaskDefinition::whole("groups");
        let calendar = TaskDefinition::whole("calendar-sync");
        let other = TaskDefinition::whole("cleanup");

        assert_eq!(compare(&groups, &calendar), Ordering::Less);
        assert_eq!(compare(&other, &calendar), Ordering::Greater);
        assert_eq!(compare(&other, &other), Ordering::Equal);
    }
}
