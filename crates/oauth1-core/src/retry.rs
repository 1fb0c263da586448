//! ============================================================================
//! Retry Logic - Exponential backoff for token exchanges
//! ============================================================================
//! Transport failures during the token round trips are not fatal on their
//! own. The session waits an exponentially growing, jittered delay before
//! the next attempt and gives up after `max_attempts` consecutive failures.
//! ============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Configuration for token exchange retry behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive transport failures tolerated before the session fails
    pub max_attempts: u32,
    /// Base delay between retries (will be multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 10000,
            jitter: true,
        }
    }
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    // Cap exponent to prevent overflow
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // 0-50% extra
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Tracks consecutive failures of one kind of request
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    failures: u32,
    next_attempt_at: Option<Instant>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the next attempt may run at `now`
    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure at `now`. Returns true once the retry budget is spent.
    pub fn record_failure(&mut self, now: Instant, config: &RetryConfig) -> bool {
        self.failures += 1;
        if self.failures >= config.max_attempts {
            self.next_attempt_at = None;
            return true;
        }
        let delay = calculate_delay(self.failures - 1, config);
        debug!("Retry attempt {} after {:?} delay", self.failures + 1, delay);
        self.next_attempt_at = Some(now + delay);
        false
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.next_attempt_at = None;
    }
}
