use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;

use progressstore::ProgressStore;
use progressstore::cli::{Cli, Command};
use progressstore::config::Config;

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let store = ProgressStore::new(cli.snapshot.unwrap_or(config.path));

    info!("progressstore starting");

    match cli.command {
        Command::Show { json } => {
            if !store.exists().await {
                println!("No pending snapshot at {}", store.path().display());
                return Ok(());
            }
            if json {
                let entries: Vec<serde_json::Value> = store.peek().await?;
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            let summary = store.summary().await?;
            println!("Snapshot: {}", store.path().display().to_string().cyan());
            println!("  Tasks: {}", summary.entries);
            println!("  Size: {} bytes", summary.bytes);

            let entries: Vec<serde_json::Value> = store.peek().await?;
            for entry in entries {
                let kind = entry.get("taskType").and_then(|v| v.as_str()).unwrap_or("?");
                let pending = entry.get("steps").and_then(|v| v.as_array()).map(|a| a.len());
                let failed = entry
                    .get("failedSteps")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                match pending {
                    Some(n) => println!("  {} {} pending, {} failed", kind.yellow(), n, failed),
                    None => println!("  {} whole task, {} failed", kind.yellow(), failed),
                }
            }
        }
        Command::Discard => {
            if store.discard().await? {
                println!("{} Discarded snapshot: {}", "✓".green(), store.path().display());
            } else {
                println!("No pending snapshot at {}", store.path().display());
            }
        }
        Command::Path => {
            println!("{}", store.path().display());
        }
    }

    Ok(())
}
