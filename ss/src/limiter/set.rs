//! Named limiters, one per configured API

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::exit::ExitHandler;

use super::LimiterError;
use super::config::QuotaConfig;
use super::quota::QuotaLimiter;

/// Process-lifetime limiters keyed by API name
#[derive(Debug, Default)]
pub struct LimiterSet {
    limiters: BTreeMap<String, Arc<QuotaLimiter>>,
}

impl LimiterSet {
    /// Build a shared limiter for every entry of the quota map
    ///
    /// Fails on the first invalid entry; limiters built before it stay bound
    /// to `exit` and are disposed at shutdown.
    pub fn from_config(quotas: &BTreeMap<String, QuotaConfig>, exit: &ExitHandler) -> Result<Self, LimiterError> {
        debug!(count = quotas.len(), "LimiterSet::from_config: called");
        let mut limiters = BTreeMap::new();

        for (name, config) in quotas {
            let limiter = QuotaLimiter::shared(name.clone(), config.clone(), exit)?;
            limiters.insert(name.clone(), limiter);
        }

        info!(apis = ?limiters.keys().collect::<Vec<_>>(), "Quota limiters ready");
        Ok(Self { limiters })
    }

    /// Limiter for one API
    pub fn get(&self, name: &str) -> Result<Arc<QuotaLimiter>, LimiterError> {
        self.limiters
            .get(name)
            .cloned()
            .ok_or_else(|| LimiterError::UnknownApi(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<QuotaLimiter>)> {
        self.limiters.iter().map(|(name, limiter)| (name.as_str(), limiter))
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Dispose every limiter now instead of waiting for shutdown
    pub fn dispose_all(&self) {
        for limiter in self.limiters.values() {
            limiter.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::{ExitConfig, Terminator};

    struct NoopTerminator;

    impl Terminator for NoopTerminator {
        fn exit(&self, _code: i32) {}
        fn kill(&self) {}
    }

    fn test_exit() -> ExitHandler {
        let config = ExitConfig {
            handle_signals: false,
            ..Default::default()
        };
        ExitHandler::with_terminator(&config, Arc::new(NoopTerminator))
    }

    fn quotas() -> BTreeMap<String, QuotaConfig> {
        let mut quotas = BTreeMap::new();
        quotas.insert("calendar".to_string(), QuotaConfig::default());
        quotas.insert(
            "directory".to_string(),
            QuotaConfig {
                daily_limit: 10_000,
                period_ms: 60_000,
                queries_per_period: 600,
                per_second_cap: None,
                burst_allowed: false,
            },
        );
        quotas
    }

    #[tokio::test]
    async fn test_builds_one_shared_limiter_per_api() {
        let exit = test_exit();
        let set = LimiterSet::from_config(&quotas(), &exit).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["calendar", "directory"]);
        assert_eq!(exit.handler_count(), 2);
        assert_eq!(set.get("directory").unwrap().config().queries_per_period, 600);
    }

    #[tokio::test]
    async fn test_unknown_api() {
        let exit = test_exit();
        let set = LimiterSet::from_config(&quotas(), &exit).unwrap();
        assert!(matches!(set.get("mail"), Err(LimiterError::UnknownApi(_))));
    }

    #[tokio::test]
    async fn test_invalid_entry_fails() {
        let exit = test_exit();
        let mut quotas = quotas();
        quotas.get_mut("directory").unwrap().period_ms = 0;

        let err = LimiterSet::from_config(&quotas, &exit).unwrap_err();
        assert!(matches!(err, LimiterError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_shutdown_disposes_every_limiter() {
        let exit = test_exit();
        let set = LimiterSet::from_config(&quotas(), &exit).unwrap();

        exit.exit_gracefully(0).await;
        assert!(set.iter().all(|(_, limiter)| limiter.is_disposed()));
    }

    #[tokio::test]
    async fn test_dispose_all_unbinds() {
        let exit = test_exit();
        let set = LimiterSet::from_config(&quotas(), &exit).unwrap();

        set.dispose_all();
        assert_eq!(exit.handler_count(), 0);
    }
}
