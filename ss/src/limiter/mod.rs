//! Outbound API quota limiting
//!
//! A [`QuotaLimiter`] guards one remote API with two gates: a short-interval
//! reservoir (burst or steady mode) and a daily reservoir. Limiters that live
//! for the whole process are built with [`QuotaLimiter::shared`] so they are
//! disposed by the exit handler.

mod config;
mod quota;
mod reservoir;
mod set;

use thiserror::Error;

use crate::exit::ExitError;

pub use config::{DAILY_WINDOW, QuotaConfig};
pub use quota::{LimiterState, LimiterStats, QuotaLimiter};
pub use set::LimiterSet;

/// Errors from the quota limiter
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("Invalid quota configuration: {0}")]
    Configuration(String),

    #[error("Limiter '{0}' has been disposed")]
    Disposed(String),

    #[error("Unknown API: {0}")]
    UnknownApi(String),

    #[error("Failed to register limiter disposal: {0}")]
    Exit(#[from] ExitError),
}
