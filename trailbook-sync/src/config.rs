//! Coordinator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for `check_connection` (ms). Expiry counts as disconnected.
    pub connection_timeout_ms: u64,
    /// Minimum gap between two watchdog-triggered refreshes (ms).
    pub refresh_debounce_ms: u64,
    /// Run a connection check during `initialize`.
    pub check_on_initialize: bool,
}

impl SyncConfig {
    /// `connection_timeout_ms` as a `Duration`.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// `refresh_debounce_ms` as a `Duration`.
    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 5_000,
            refresh_debounce_ms: 1_000,
            check_on_initialize: true,
        }
    }
}
