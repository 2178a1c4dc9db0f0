//! Quota configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::LimiterError;

/// Length of the daily reservoir window
pub const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Outbound quota of one API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Operations admitted per rolling 24h window
    #[serde(rename = "daily-limit")]
    pub daily_limit: u64,

    /// Length of the short-interval period in milliseconds
    #[serde(rename = "period-ms")]
    pub period_ms: u64,

    /// Operations admitted per short-interval period
    #[serde(rename = "queries-per-period")]
    pub queries_per_period: u32,

    /// Upper bound on instantaneous rate, operations per second
    #[serde(rename = "per-second-cap", default, skip_serializing_if = "Option::is_none")]
    pub per_second_cap: Option<f64>,

    /// Allow bursts up to `queries_per_period` instead of fixed spacing
    #[serde(rename = "burst-allowed", default)]
    pub burst_allowed: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        // Google Calendar API defaults
        Self {
            daily_limit: 1_000_000,
            period_ms: 100_000,
            queries_per_period: 1_500,
            per_second_cap: Some(10.0),
            burst_allowed: true,
        }
    }
}

impl QuotaConfig {
    /// Reject values the gates cannot be built from
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.period_ms == 0 {
            return Err(LimiterError::Configuration("period-ms must be greater than 0".to_string()));
        }
        if self.queries_per_period == 0 {
            return Err(LimiterError::Configuration(
                "queries-per-period must be greater than 0".to_string(),
            ));
        }
        if let Some(cap) = self.per_second_cap
            && !(cap.is_finite() && cap > 0.0)
        {
            return Err(LimiterError::Configuration(format!(
                "per-second-cap must be a positive number, got {}",
                cap
            )));
        }
        Ok(())
    }

    /// The short-interval period as a Duration
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Minimum spacing implied by the per-second cap
    pub fn cap_spacing(&self) -> Option<Duration> {
        self.per_second_cap
            .map(|cap| Duration::from_nanos((1_000_000_000.0 / cap).round() as u64))
    }

    /// Minimum spacing between two admissions in steady mode
    pub fn steady_spacing(&self) -> Duration {
        let per_query = self.period() / self.queries_per_period;
        match self.cap_spacing() {
            Some(cap) => per_query.max(cap),
            None => per_query,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(period_ms: u64, queries_per_period: u32, per_second_cap: Option<f64>) -> QuotaConfig {
        QuotaConfig {
            daily_limit: 100,
            period_ms,
            queries_per_period,
            per_second_cap,
            burst_allowed: false,
        }
    }

    #[test]
    fn test_default_is_valid() {
        assert!(QuotaConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_period() {
        let err = config(0, 10, None).validate().unwrap_err();
        assert!(matches!(err, LimiterError::Configuration(_)));
    }

    #[test]
    fn test_rejects_zero_queries() {
        let err = config(1000, 0, None).validate().unwrap_err();
        assert!(matches!(err, LimiterError::Configuration(_)));
    }

    #[test]
    fn test_rejects_bad_cap() {
        assert!(config(1000, 10, Some(0.0)).validate().is_err());
        assert!(config(1000, 10, Some(f64::NAN)).validate().is_err());
        assert!(config(1000, 10, Some(-2.0)).validate().is_err());
    }

    #[test]
    fn test_steady_spacing_uses_period_share() {
        assert_eq!(config(1000, 4, None).steady_spacing(), Duration::from_millis(250));
    }

    #[test]
    fn test_steady_spacing_respects_cap() {
        // period share is 10ms but the cap only allows one every 200ms
        assert_eq!(config(1000, 100, Some(5.0)).steady_spacing(), Duration::from_millis(200));
        // cap looser than the period share
        assert_eq!(config(1000, 2, Some(50.0)).steady_spacing(), Duration::from_millis(500));
    }

    #[test]
    fn test_deserialize_kebab_case() {
        let yaml = "daily-limit: 10\nperiod-ms: 1000\nqueries-per-period: 5\n";
        let config: QuotaConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.daily_limit, 10);
        assert_eq!(config.per_second_cap, None);
        assert!(!config.burst_allowed);
    }
}
