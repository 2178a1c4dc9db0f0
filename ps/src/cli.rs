//! CLI argument parsing for progressstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ps")]
#[command(author, version, about = "Inspect and manage task progress snapshots", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Snapshot file (overrides config)
    #[arg(short, long)]
    pub snapshot: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the pending snapshot without consuming it
    Show {
        /// Print the raw snapshot JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete the pending snapshot
    Discard,

    /// Print the snapshot file path
    Path,
}
