use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for one scene session.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Quiet period before a local edit is written to durable storage.
    pub save_debounce_ms: u64,
    /// Quiet period before a focus/visibility-triggered staleness check.
    pub tab_sync_debounce_ms: u64,
    /// Period of the recurring staleness check.
    pub stale_check_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: 300,
            tab_sync_debounce_ms: 50,
            stale_check_interval_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn tab_sync_debounce(&self) -> Duration {
        Duration::from_millis(self.tab_sync_debounce_ms)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_check_interval_ms)
    }
}
