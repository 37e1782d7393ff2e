//! In-process sliding-window limiter.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{RateDecision, RateLimitConfig, RateLimitError, RateLimiter};
use crate::kernel::resource_key::ResourceKey;

/// Keeps a log of grant times per key and counts those inside the window.
///
/// The whole check-and-record happens under one mutex, so concurrent workers
/// in this process share the quota exactly.
pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<ResourceKey, VecDeque<Instant>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, key: &ResourceKey) -> RateDecision {
        let Some(rule) = self.config.rule_for(key) else {
            return RateDecision::Granted;
        };
        let window = rule.window();
        let now = Instant::now();

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let log = windows.entry(key.clone()).or_default();

        while let Some(&oldest) = log.front() {
            if now.duration_since(oldest) >= window {
                log.pop_front();
            } else {
                break;
            }
        }

        if (log.len() as u64) < u64::from(rule.limit) {
            log.push_back(now);
            return RateDecision::Granted;
        }

        let retry_after = match log.front() {
            Some(&oldest) => (oldest + window).saturating_duration_since(now),
            None => window,
        };
        // A zero wait would let a caller spin on the same instant.
        let retry_after = retry_after.max(Duration::from_millis(1));

        debug!(resource_key = %key, retry_after_ms = retry_after.as_millis() as u64, "rate limit reached");
        RateDecision::Rejected { retry_after }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn try_acquire(&self, key: &ResourceKey) -> Result<RateDecision, RateLimitError> {
        Ok(self.check(key))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kernel::rate_limit::RateLimitRule;

    fn limiter(limit: u32, window: Duration) -> SlidingWindowRateLimiter {
        SlidingWindowRateLimiter::new(
            RateLimitConfig::new().with_rule("apify/scraper", RateLimitRule::new(limit, window)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn n_calls_granted_then_rejected_with_positive_retry_after() {
        let limiter = limiter(3, Duration::from_secs(10));
        let key = ResourceKey::new("apify/scraper");

        for _ in 0..3 {
            assert!(limiter.try_acquire(&key).await.unwrap().is_granted());
        }

        match limiter.try_acquire(&key).await.unwrap() {
            RateDecision::Rejected { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(10));
            }
            RateDecision::Granted => panic!("fourth call in window should be rejected"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slot_frees_after_window_slides() {
        let limiter = limiter(1, Duration::from_secs(5));
        let key = ResourceKey::new("apify/scraper");

        assert!(limiter.try_acquire(&key).await.unwrap().is_granted());
        tokio::time::advance(Duration::from_secs(2)).await;

        match limiter.try_acquire(&key).await.unwrap() {
            RateDecision::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(3)),
            RateDecision::Granted => panic!("should still be limited"),
        }

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(limiter.try_acquire(&key).await.unwrap().is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn both_key_spellings_share_one_bucket() {
        let limiter = limiter(1, Duration::from_secs(60));

        assert!(limiter.try_acquire(&ResourceKey::new("apify/scraper")).await.unwrap().is_granted());
        assert!(!limiter.try_acquire(&ResourceKey::new("apify~scraper")).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn keys_are_limited_independently() {
        let limiter = SlidingWindowRateLimiter::new(
            RateLimitConfig::new()
                .with_rule("a/one", RateLimitRule::new(1, Duration::from_secs(60)))
                .with_rule("b/two", RateLimitRule::new(2, Duration::from_secs(60))),
        );

        assert!(limiter.try_acquire(&"a/one".into()).await.unwrap().is_granted());
        assert!(!limiter.try_acquire(&"a/one".into()).await.unwrap().is_granted());
        assert!(limiter.try_acquire(&"b/two".into()).await.unwrap().is_granted());
        assert!(limiter.try_acquire(&"b/two".into()).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn unconfigured_key_is_always_granted() {
        let limiter = limiter(1, Duration::from_secs(60));
        for _ in 0..10 {
            assert!(limiter.try_acquire(&"other/actor".into()).await.unwrap().is_granted());
        }
    }

    #[tokio::test]
    async fn zero_limit_rejects_everything() {
        let limiter = limiter(0, Duration::from_secs(1));
        let decision = limiter.try_acquire(&"apify/scraper".into()).await.unwrap();
        assert_eq!(decision, RateDecision::Rejected { retry_after: Duration::from_secs(1) });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_limit() {
        let limiter = Arc::new(limiter(5, Duration::from_secs(60)));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.try_acquire(&"apify/scraper".into()).await.unwrap().is_granted()
                })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }
}
