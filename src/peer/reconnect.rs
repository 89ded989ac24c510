//! Reconnection policy

use std::time::Duration;

use crate::config::RoomRtcConfig;

/// Exponential backoff policy for per-peer reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum attempts before the peer is marked terminally failed
    pub max_attempts: u32,
    /// Initial backoff in milliseconds
    pub backoff_initial_ms: u64,
    /// Backoff ceiling in milliseconds
    pub backoff_max_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Add 0-25% jitter to each delay
    pub jitter_enabled: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &RoomRtcConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            backoff_initial_ms: config.reconnect_backoff_initial_ms,
            backoff_max_ms: config.reconnect_backoff_max_ms,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt` (zero-based).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64);

        let final_ms = if self.jitter_enabled {
            backoff_ms + time_jitter(backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Pseudo-random jitter seeded from the clock; avoids thundering herds
/// without pulling in an RNG.
fn time_jitter(max: f64) -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as f64;
    (nanos / 1_000_000_000.0) * max
}
