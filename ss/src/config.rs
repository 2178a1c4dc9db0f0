//! Configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::CachePolicy;
use crate::exit::ExitConfig;
use crate::limiter::QuotaConfig;

/// Main schedsync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Log level used when --log-level is not given
    pub log_level: Option<String>,

    /// Quota per remote API, keyed by API name
    pub quotas: BTreeMap<String, QuotaConfig>,

    /// Cutoff applied to cached response expirations
    pub cache: CachePolicy,

    pub runner: RunnerConfig,

    pub progress: ProgressConfig,

    pub exit: ExitConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut quotas = BTreeMap::new();
        quotas.insert("calendar".to_string(), QuotaConfig::default());

        Self {
            log_level: None,
            quotas,
            cache: CachePolicy::default(),
            runner: RunnerConfig::default(),
            progress: ProgressConfig::default(),
            exit: ExitConfig::default(),
        }
    }
}

/// Task runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunnerConfig {
    /// Steps dispatched concurrently per batch; fractional values are truncated
    pub max_concurrent_steps: f64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 4.0,
        }
    }
}

/// Progress snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub path: PathBuf,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            path: progressstore::config::default_snapshot_path(),
        }
    }
}

impl Config {
    /// Load config from the explicit path, the working directory, the user
    /// config directory, or fall back to defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::default_locations() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = match config_path {
            Some(path) => path.clone(),
            None => Self::default_locations().into_iter().find(|p| p.exists())?,
        };
        let content = fs::read_to_string(path).ok()?;
        let config: Self = serde_yaml::from_str(&content).ok()?;
        config.log_level
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from("schedsync.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            locations.push(config_dir.join("schedsync").join("schedsync.yml"));
        }
        locations
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
