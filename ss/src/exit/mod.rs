//! Graceful shutdown
//!
//! A single [`ExitHandler`] per process collects asynchronous cleanup
//! callbacks and runs them in order, exactly once, when the process receives
//! a termination signal, hits a fatal error, or is asked to exit.

mod config;
mod handler;
mod recover;
mod registry;
mod signals;
mod terminator;

pub use config::ExitConfig;
pub use handler::{ExitError, ExitHandler, ExitOutcome, ExitReason};
pub use recover::catch_recovered;
pub use registry::{HandlerId, ShutdownHandler};
pub use terminator::{ProcessTerminator, Terminator};
