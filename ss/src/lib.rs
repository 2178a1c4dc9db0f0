//! schedsync - operational core of the class-schedule synchronizer
//!
//! Everything here exists to keep a long-running sync job well-behaved
//! against quota-constrained remote APIs and restartable at any moment.
//!
//! # Modules
//!
//! - [`limiter`] - dual-reservoir quota limiting for outbound calls
//! - [`exit`] - ordered, one-shot shutdown handler chain
//! - [`runner`] - task queue with bounded-concurrency step dispatch
//! - [`progress`] - persisting the queue across restarts
//! - [`cache`] - capping cached response lifetimes at the nightly cutoff
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cache;
pub mod cli;
pub mod config;
pub mod exit;
pub mod limiter;
pub mod progress;
pub mod runner;

pub use cache::{CacheError, CacheExpiration, CachePolicy};
pub use config::Config;
pub use exit::{ExitConfig, ExitHandler, ExitOutcome};
pub use limiter::{LimiterError, LimiterSet, QuotaConfig, QuotaLimiter};
pub use progress::{ResumeError, bind_progress_saver, resume_runner};
pub use runner::{ExecutorRegistry, FailedStep, StepExecutor, TaskDefinition, TaskHandler, TaskRunner, WorkUnit};
