//! Per-resource request quotas.
//!
//! Each external resource key gets its own count-based window. Callers ask
//! with [`RateLimiter::try_acquire`] and either get a slot or the time until
//! the next one frees up; nothing here ever waits on the caller's behalf.
//!
//! Two backends:
//! - [`SlidingWindowRateLimiter`] - in-process, mutex-guarded request logs
//! - [`PostgresRateLimiter`] - fixed window shared by every process on the database

mod postgres;
mod sliding_window;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::resource_key::ResourceKey;

pub use postgres::PostgresRateLimiter;
pub use sliding_window::SlidingWindowRateLimiter;

/// Quota for one resource key: at most `limit` calls per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_ms: u64,
}

impl RateLimitRule {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Mapping from resource key to quota, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    rules: HashMap<ResourceKey, RateLimitRule>,
    default_rule: Option<RateLimitRule>,
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the rule for a key. The key is normalized first.
    pub fn with_rule(mut self, key: impl Into<ResourceKey>, rule: RateLimitRule) -> Self {
        self.rules.insert(key.into(), rule);
        self
    }

    /// Rule applied to keys that have no explicit entry.
    pub fn with_default_rule(mut self, rule: RateLimitRule) -> Self {
        self.default_rule = Some(rule);
        self
    }

    /// Parse the `{"owner/actor": {"limit": 10, "windowMs": 60000}}` form.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let parsed: HashMap<ResourceKey, RateLimitRule> = serde_json::from_str(raw)?;
        Ok(Self {
            rules: parsed,
            default_rule: None,
        })
    }

    /// Rule for a key, falling back to the default. `None` means unlimited.
    pub fn rule_for(&self, key: &ResourceKey) -> Option<RateLimitRule> {
        self.rules.get(key).copied().or(self.default_rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Granted,
    Rejected { retry_after: Duration },
}

impl RateDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, RateDecision::Granted)
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Quota check shared by every caller of an external resource.
///
/// Implementations must make the check-and-count atomic: two concurrent
/// callers can never both take the last slot in a window.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn try_acquire(&self, key: &ResourceKey) -> Result<RateDecision, RateLimitError>;
}
