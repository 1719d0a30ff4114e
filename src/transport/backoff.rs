use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Exponential backoff with bounded jitter for retrying writes into a full
/// channel. Never gives up: after `error_after` attempts every further
/// multiple of `error_after` is reported, and retrying continues.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    growth: f64,
    max: Duration,
    jitter: Duration,
    error_after: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl Backoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            growth: config.growth.max(1.0),
            max: Duration::from_millis(config.max_ms.max(config.base_ms)),
            jitter: Duration::from_millis(config.jitter_ms),
            error_after: config.error_after,
        }
    }

    /// Delay before retry number `attempt` (1-based), jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.base.as_secs_f64() * self.growth.powi(exponent);
        let capped = Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()));
        capped + self.jitter()
    }

    /// Whether a failure at `attempt` deserves an error log line.
    pub fn should_report(&self, attempt: u32) -> bool {
        self.error_after > 0 && attempt >= self.error_after && attempt % self.error_after == 0
    }

    fn jitter(&self) -> Duration {
        let bound = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}
