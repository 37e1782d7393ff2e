//! Exponential backoff for external calls.

use std::time::Duration;

/// Retry configuration for one External Call Client instance.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt when the caller does not say otherwise
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt
    pub base_backoff: Duration,
    /// Ceiling for any single wait, including server-provided delays
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// A server-provided delay (429 `Retry-After`, limiter hint) wins over the
    /// computed backoff. Both are capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32, server_hint: Option<Duration>) -> Duration {
        if let Some(hint) = server_hint {
            return hint.min(self.max_backoff);
        }

        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
