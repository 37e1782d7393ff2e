//! Database-backed fixed-window limiter shared across processes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use super::{RateDecision, RateLimitConfig, RateLimitError, RateLimiter};
use crate::kernel::resource_key::ResourceKey;

/// Fixed-window counter stored in `rate_limit_windows`.
///
/// Each check is one upsert that either opens a fresh window or bumps the
/// counter, so the row lock serializes concurrent callers from any process.
/// Rejected attempts are counted too but never move the window start.
pub struct PostgresRateLimiter {
    pool: PgPool,
    config: RateLimitConfig,
}

impl PostgresRateLimiter {
    pub fn new(pool: PgPool, config: RateLimitConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl RateLimiter for PostgresRateLimiter {
    async fn try_acquire(&self, key: &ResourceKey) -> Result<RateDecision, RateLimitError> {
        let Some(rule) = self.config.rule_for(key) else {
            return Ok(RateDecision::Granted);
        };

        let (request_count, window_start, now) =
            sqlx::query_as::<_, (i64, DateTime<Utc>, DateTime<Utc>)>(
                r#"
                INSERT INTO rate_limit_windows (resource_key, window_start, request_count)
                VALUES ($1, NOW(), 1)
                ON CONFLICT (resource_key) DO UPDATE SET
                    window_start = CASE
                        WHEN rate_limit_windows.window_start <= NOW() - ($2 || ' milliseconds')::INTERVAL
                        THEN NOW()
                        ELSE rate_limit_windows.window_start
                    END,
                    request_count = CASE
                        WHEN rate_limit_windows.window_start <= NOW() - ($2 || ' milliseconds')::INTERVAL
                        THEN 1
                        ELSE rate_limit_windows.request_count + 1
                    END
                RETURNING request_count, window_start, NOW()
                "#,
            )
            .bind(key.as_str())
            .bind(rule.window_ms.to_string())
            .fetch_one(&self.pool)
            .await?;

        if request_count <= i64::from(rule.limit) {
            return Ok(RateDecision::Granted);
        }

        let window_end = window_start + chrono::Duration::milliseconds(rule.window_ms as i64);
        let retry_after = (window_end - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1));

        debug!(
            resource_key = %key,
            request_count,
            retry_after_ms = retry_after.as_millis() as u64,
            "shared rate limit reached"
        );
        Ok(RateDecision::Rejected { retry_after })
    }
}
