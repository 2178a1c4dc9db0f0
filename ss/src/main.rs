//! schedsync - entry point

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tracing::{debug, info};

use progressstore::ProgressStore;
use schedsync::cache::CacheExpiration;
use schedsync::cli::{Cli, Command};
use schedsync::config::Config;
use schedsync::exit::{ExitHandler, ExitOutcome};
use schedsync::limiter::LimiterSet;
use schedsync::runner::TaskDefinition;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("schedsync")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("schedsync.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| eyre!("Invalid RFC 3339 timestamp '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let exit = ExitHandler::new(&config.exit);
    exit.install_panic_hook()?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Expiry { at, expires } => cmd_expiry(&config, at.as_deref(), expires.as_deref()),
        Command::Check => cmd_check(&config, &exit).await,
        Command::Pending { json } => cmd_pending(&config, json).await,
    }
}

/// Print the next cache cutoff and optionally clamp an expiration
fn cmd_expiry(config: &Config, at: Option<&str>, expires: Option<&str>) -> Result<()> {
    debug!(?at, ?expires, "cmd_expiry: called");
    let cache = CacheExpiration::new(&config.cache)?;

    let now = match at {
        Some(value) => parse_instant(value)?,
        None => Utc::now(),
    };
    let max = cache.max_expiration(now);

    println!(
        "{} {} ({})",
        "Cutoff:".bold(),
        cache.to_civil(max).to_rfc3339(),
        max.to_rfc3339()
    );

    if let Some(value) = expires {
        let requested = parse_instant(value)?;
        let clamped = cache.clamp_expiration_to(requested, max);
        let note = if clamped < requested {
            "clamped".yellow()
        } else {
            "unchanged".green()
        };
        println!("{} {} [{}]", "Expires:".bold(), clamped.to_rfc3339(), note);
    }
    Ok(())
}

/// Build the configured limiters, show them, and shut down through the chain
async fn cmd_check(config: &Config, exit: &ExitHandler) -> Result<()> {
    debug!("cmd_check: called");
    let limiters = LimiterSet::from_config(&config.quotas, exit)?;

    if limiters.is_empty() {
        println!("{}", "No quotas configured".dimmed());
    }

    for (name, limiter) in limiters.iter() {
        let quota = limiter.config();
        let state = limiter.state().await;
        let mode = if quota.burst_allowed { "burst" } else { "steady" };

        println!("{}", name.bold());
        println!("  mode:    {}", mode.cyan());
        println!(
            "  short:   {} per {}ms ({} tokens ready)",
            quota.queries_per_period, quota.period_ms, state.short_tokens
        );
        match quota.cap_spacing() {
            Some(spacing) => println!("  cap:     one per {:?}", spacing),
            None => println!("  cap:     {}", "none".dimmed()),
        }
        if !quota.burst_allowed {
            println!("  spacing: {:?}", quota.steady_spacing());
        }
        println!("  daily:   {} of {}", state.daily_remaining, quota.daily_limit);
    }

    match exit.exit_gracefully(0).await {
        ExitOutcome::Exited(_) => Ok(()),
        ExitOutcome::ForceKilled => Err(eyre!("Shutdown handlers failed")),
        ExitOutcome::AlreadyHandled => Ok(()),
    }
}

/// List the tasks waiting in the snapshot without consuming it
async fn cmd_pending(config: &Config, json: bool) -> Result<()> {
    debug!(json, "cmd_pending: called");
    let store = ProgressStore::new(&config.progress.path);

    let tasks: Vec<TaskDefinition<serde_json::Value>> = match store.peek().await {
        Ok(tasks) => tasks,
        Err(e) if e.is_missing() => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("{}", "No pending tasks".dimmed());
        return Ok(());
    }

    println!("{} {}", "Pending tasks:".bold(), tasks.len());
    for task in &tasks {
        let failed = task.failed_count();
        let failed_text = if failed > 0 {
            format!("{} failed", failed).red()
        } else {
            "0 failed".normal()
        };

        if task.is_stepped() {
            println!("  {} {} steps, {}", task.task_type.cyan(), task.pending_steps(), failed_text);
        } else if task.has_pending_work() {
            println!("  {} whole task, {}", task.task_type.cyan(), failed_text);
        } else {
            println!("  {} retry only, {}", task.task_type.cyan(), failed_text);
        }
    }
    Ok(())
}
