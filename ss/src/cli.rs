//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// schedsync - quota-limited, resumable schedule synchronization
#[derive(Parser)]
#[command(
    name = "ss",
    about = "Operational core of the class-schedule synchronizer",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the cache cutoff and clamp an expiration to it
    Expiry {
        /// Reference instant (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,

        /// Expiration to clamp (RFC 3339)
        #[arg(long)]
        expires: Option<String>,
    },

    /// Build every configured limiter and show its gates
    Check,

    /// List the tasks waiting in the progress snapshot
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
