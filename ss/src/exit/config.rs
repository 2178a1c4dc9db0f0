//! Exit handler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shutdown chain configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Wall-clock budget for the whole handler chain, in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Whether the budget is enforced
    #[serde(rename = "timeout-enabled")]
    pub timeout_enabled: bool,

    /// Install termination signal listeners when handlers are bound
    #[serde(rename = "handle-signals")]
    pub handle_signals: bool,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            timeout_enabled: true,
            handle_signals: true,
        }
    }
}

impl ExitConfig {
    /// Get the chain budget as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
