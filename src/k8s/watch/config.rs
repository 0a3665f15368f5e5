/**
 * Configuration constants for watch subscriptions
 */
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-side idle cutoff requested for each watch connection (one day)
pub const WATCH_TIMEOUT_SECONDS: u64 = 60 * 60 * 24;

/// Delay before the first reconnect attempt
pub const INITIAL_BACKOFF_MILLIS: u64 = 250;

/// Upper bound for the exponential reconnect backoff
pub const MAX_BACKOFF_MILLIS: u64 = 60_000;

/// Longest single watch frame accepted before the stream is considered malformed
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Cursor sent when no position is known, requesting list-then-watch
pub const RESYNC_CURSOR: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    /// Sent as `timeoutSeconds` unless the caller's query sets it
    pub timeout_seconds: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: WATCH_TIMEOUT_SECONDS,
            initial_backoff_ms: INITIAL_BACKOFF_MILLIS,
            max_backoff_ms: MAX_BACKOFF_MILLIS,
        }
    }
}

impl WatchConfig {
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }

    /// Doubled backoff, capped at `max_backoff`
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff())
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_MILLIS > 0, "INITIAL_BACKOFF_MILLIS must be greater than 0");
    assert!(
        MAX_BACKOFF_MILLIS >= INITIAL_BACKOFF_MILLIS,
        "MAX_BACKOFF_MILLIS must not be below INITIAL_BACKOFF_MILLIS"
    );
    assert!(MAX_FRAME_BYTES > 0, "MAX_FRAME_BYTES must be greater than 0");
};
