//! State manager configuration.

use std::time::Duration;

/// State manager configuration.
#[derive(Debug, Clone)]
pub struct StateManagerConfig {
    /// Housekeeping tick while not synced.
    pub housekeeping_interval: Duration,

    /// Wait before the first re-request of a block. Doubles per attempt.
    pub block_request_timeout: Duration,

    /// Upper bound for the re-request backoff.
    pub max_request_backoff: Duration,

    /// Minimum gap between state index pings while not synced.
    pub pingpong_interval: Duration,

    /// Maximum number of indices fetched ahead of the buffered run of blocks.
    pub sync_window: u32,

    /// Applied blocks kept for serving `GetBlock` requests from peers.
    pub block_history: usize,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            housekeeping_interval: Duration::from_millis(500),
            block_request_timeout: Duration::from_secs(1),
            max_request_backoff: Duration::from_secs(16),
            pingpong_interval: Duration::from_secs(2),
            sync_window: 64,
            block_history: 256,
        }
    }
}

impl StateManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn with_block_request_timeout(mut self, timeout: Duration) -> Self {
        self.block_request_timeout = timeout;
        self
    }

    pub fn with_max_request_backoff(mut self, max: Duration) -> Self {
        self.max_request_backoff = max;
        self
    }

    pub fn with_sync_window(mut self, window: u32) -> Self {
        self.sync_window = window;
        self
    }

    /// Backoff before re-requesting a block that was asked for `attempts`
    /// times already.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        self.block_request_timeout
            .saturating_mul(factor)
            .min(self.max_request_backoff)
    }
}
