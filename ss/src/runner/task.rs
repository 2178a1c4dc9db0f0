//! Task definitions
//!
//! The serialized form is the on-disk progress snapshot, so field names and
//! omission rules here must stay stable across releases.

use serde::{Deserialize, Serialize};

/// A step that failed, with the error text captured at the time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep<T> {
    pub error: String,

    /// The step value, absent when the whole task failed as one unit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
}

impl<T> FailedStep<T> {
    pub fn new(error: impl Into<String>, value: Option<T>) -> Self {
        Self {
            error: error.into(),
            value,
        }
    }

    /// The unit to hand back to the executor on retry
    pub fn unit(&self) -> WorkUnit<T>
    where
        T: Clone,
    {
        match &self.value {
            Some(value) => WorkUnit::Step(value.clone()),
            None => WorkUnit::Whole,
        }
    }
}

/// What the executor is asked to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkUnit<T> {
    /// The task has no steps and runs as a single atomic unit
    Whole,
    /// One discrete step of the task
    Step(T),
}

impl<T> WorkUnit<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Whole => None,
            Self::Step(value) => Some(value),
        }
    }
}

/// A unit of work: a type identifier plus optional discrete steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition<T> {
    pub task_type: String,

    /// Pending steps; absent or empty means the task is one atomic unit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<T>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_steps: Option<Vec<FailedStep<T>>>,
}

impl<T> TaskDefinition<T> {
    /// A task that runs as one atomic unit
    pub fn whole(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            steps: None,
            failed_steps: None,
        }
    }

    /// A task split into discrete steps
    pub fn with_steps(task_type: impl Into<String>, steps: Vec<T>) -> Self {
        Self {
            task_type: task_type.into(),
            steps: Some(steps),
            failed_steps: None,
        }
    }

    pub fn pending_steps(&self) -> usize {
        self.steps.as_ref().map_or(0, Vec::len)
    }

    pub fn failed_count(&self) -> usize {
        self.failed_steps.as_ref().map_or(0, Vec::len)
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }

    pub fn is_stepped(&self) -> bool {
        self.pending_steps() > 0
    }

    /// Whether the task still has work that was never attempted
    ///
    /// An empty step list without recorded failures is an undone atomic unit.
    pub fn has_pending_work(&self) -> bool {
        self.is_stepped() || !self.has_failures()
    }

    /// Pending units: the step count, or 1 for an undone atomic unit
    pub fn remaining_units(&self) -> usize {
        if self.is_stepped() {
            self.pending_steps()
        } else if self.has_failures() {
            0
        } else {
            1
        }
    }

    pub(crate) fn record_failure(&mut self, failure: FailedStep<T>) {
        self.failed_steps.get_or_insert_with(Vec::new).push(failure);
    }
}
