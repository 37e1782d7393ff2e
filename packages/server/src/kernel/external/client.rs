use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use super::{
    is_server_error, BaseExternalTransport, CallOptions, ExternalCallError, ExternalRequest, ExternalResponse,
    RetryPolicy, TransportError,
};
use crate::kernel::rate_limit::{RateDecision, RateLimiter};
use crate::kernel::resource_key::ResourceKey;

/// Why a single attempt did not produce a response.
#[derive(Debug)]
enum AttemptFailure {
    Limited(Duration),
    Transport(TransportError),
    TimedOut(Duration),
    LimiterUnavailable(String),
}

impl AttemptFailure {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptFailure::Transport(e) => e.is_retryable(),
            AttemptFailure::Limited(_)
            | AttemptFailure::TimedOut(_)
            | AttemptFailure::LimiterUnavailable(_) => true,
        }
    }

    fn server_delay(&self) -> Option<Duration> {
        match self {
            AttemptFailure::Limited(retry_after) => Some(*retry_after),
            AttemptFailure::Transport(e) => e.server_delay(),
            AttemptFailure::TimedOut(_) | AttemptFailure::LimiterUnavailable(_) => None,
        }
    }

    fn into_error(
        self,
        resource_key: ResourceKey,
        attempts: u32,
        fallback_delay: Duration,
    ) -> ExternalCallError {
        match self {
            AttemptFailure::Limited(retry_after) => ExternalCallError::RateLimitExceeded {
                resource_key,
                retry_after,
                attempts,
            },
            AttemptFailure::Transport(e) if e.is_upstream_rate_limit() => {
                ExternalCallError::RateLimitExceeded {
                    resource_key,
                    retry_after: e.server_delay().unwrap_or(fallback_delay),
                    attempts,
                }
            }
            AttemptFailure::Transport(TransportError::Status {
                status, message, ..
            }) if !is_server_error(status) => ExternalCallError::Fatal {
                resource_key,
                status,
                message,
                attempts,
            },
            AttemptFailure::Transport(e) => ExternalCallError::Transient {
                resource_key,
                message: e.to_string(),
                attempts,
            },
            AttemptFailure::TimedOut(timeout) => ExternalCallError::Transient {
                resource_key,
                message: format!("request timed out after {}ms", timeout.as_millis()),
                attempts,
            },
            AttemptFailure::LimiterUnavailable(message) => ExternalCallError::Transient {
                resource_key,
                message,
                attempts,
            },
        }
    }
}

/// Wraps a transport with rate limiting, a per-request timeout, and
/// exponential-backoff retries.
pub struct ExternalCallClient {
    transport: Arc<dyn BaseExternalTransport>,
    limiter: Arc<dyn RateLimiter>,
    policy: RetryPolicy,
    default_timeout: Duration,
}

impl ExternalCallClient {
    pub fn new(
        transport: Arc<dyn BaseExternalTransport>,
        limiter: Arc<dyn RateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            limiter,
            policy,
            default_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute one logical call, retrying per policy.
    ///
    /// With `retries = 0` a limiter rejection fails immediately with
    /// [`ExternalCallError::RateLimitExceeded`]; nothing waits silently.
    pub async fn execute(
        &self,
        resource_key: impl Into<ResourceKey>,
        request: &ExternalRequest,
        options: CallOptions,
    ) -> Result<ExternalResponse, ExternalCallError> {
        let resource_key = resource_key.into();
        let retries = options.retries.unwrap_or(self.policy.max_retries);
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        let mut attempt: u32 = 0;
        loop {
            let failure = match self.attempt_once(&resource_key, request, timeout).await {
                Ok(mut response) => {
                    response.attempts = attempt + 1;
                    if attempt > 0 {
                        debug!(resource_key = %resource_key, attempts = attempt + 1, "external call succeeded after retries");
                    }
                    return Ok(response);
                }
                Err(failure) => failure,
            };

            if !failure.is_retryable() || attempt >= retries {
                let fallback_delay = self.policy.delay_for(attempt, None);
                return Err(failure.into_error(resource_key, attempt + 1, fallback_delay));
            }

            let delay = self.policy.delay_for(attempt, failure.server_delay());
            match &failure {
                AttemptFailure::Limited(_) => debug!(
                    resource_key = %resource_key,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited locally, backing off"
                ),
                other => warn!(
                    resource_key = %resource_key,
                    attempt = attempt + 1,
                    max_attempts = retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    failure = ?other,
                    "external call failed, retrying"
                ),
            }

            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt_once(
        &self,
        resource_key: &ResourceKey,
        request: &ExternalRequest,
        timeout: Duration,
    ) -> Result<ExternalResponse, AttemptFailure> {
        match self.limiter.try_acquire(resource_key).await {
            Ok(RateDecision::Granted) => {}
            Ok(RateDecision::Rejected { retry_after }) => {
                return Err(AttemptFailure::Limited(retry_after))
            }
            Err(e) => return Err(AttemptFailure::LimiterUnavailable(e.to_string())),
        }

        match tokio::time::timeout(timeout, self.transport.send(resource_key, request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(AttemptFailure::Transport(e)),
            Err(_) => Err(AttemptFailure::TimedOut(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kernel::rate_limit::{RateLimitConfig, RateLimitRule, SlidingWindowRateLimiter};
    use crate::kernel::test_dependencies::MockTransport;

    const KEY: &str = "apify/e-commerce-scraping-tool";

    fn unlimited() -> Arc<dyn RateLimiter> {
        Arc::new(SlidingWindowRateLimiter::new(RateLimitConfig::new()))
    }

    fn client(transport: Arc<MockTransport>, limiter: Arc<dyn RateLimiter>) -> ExternalCallClient {
        ExternalCallClient::new(
            transport,
            limiter,
            RetryPolicy::new(3, Duration::from_millis(100)),
        )
    }

    fn request() -> ExternalRequest {
        ExternalRequest::new(json!({"startUrls": [{"url": "https://example.com/item/1"}]}))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let transport = Arc::new(
            MockTransport::new()
                .with_failure(TransportError::Network("connection reset".into()))
                .with_failure(TransportError::status(502, "bad gateway"))
                .with_response(ExternalResponse::ok(json!([{"title": "Lamp"}]))),
        );
        let client = client(transport.clone(), unlimited());

        let response = client.execute(KEY, &request(), CallOptions::default()).await.unwrap();

        assert_eq!(response.attempts, 3);
        assert_eq!(response.retries(), 2);
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_status_is_not_retried() {
        let transport = Arc::new(
            MockTransport::new()
                .with_failure(TransportError::status(404, "actor not found"))
                .with_response(ExternalResponse::ok(json!([]))),
        );
        let client = client(transport.clone(), unlimited());

        let err = client.execute(KEY, &request(), CallOptions::default()).await.unwrap_err();

        assert!(matches!(err, ExternalCallError::Fatal { status: 404, .. }));
        assert!(!err.is_retryable());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_status_is_fatal() {
        let failure = TransportError::status(600, "nonstandard");
        assert!(!failure.is_retryable());

        let transport = Arc::new(MockTransport::always_failing(failure));
        let client = client(transport.clone(), unlimited());

        let err = client.execute(KEY, &request(), CallOptions::default()).await.unwrap_err();

        assert!(matches!(err, ExternalCallError::Fatal { status: 600, .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_failures_surface_as_transient() {
        let transport = Arc::new(MockTransport::always_failing(TransportError::status(500, "boom")));
        let client = client(transport.clone(), unlimited());

        let err = client
            .execute(KEY, &request(), CallOptions::default().retries(2))
            .await
            .unwrap_err();

        assert!(matches!(err, ExternalCallError::Transient { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_429_honors_retry_after() {
        let transport = Arc::new(
            MockTransport::new()
                .with_failure(TransportError::Status {
                    status: 429,
                    message: "too many requests".into(),
                    retry_after: Some(Duration::from_secs(7)),
                })
                .with_response(ExternalResponse::ok(json!([]))),
        );
        let client = client(transport.clone(), unlimited());

        let started = tokio::time::Instant::now();
        let response = client.execute(KEY, &request(), CallOptions::default()).await.unwrap();

        assert_eq!(response.attempts, 2);
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_upstream_429_is_rate_limit_error() {
        let transport = Arc::new(MockTransport::always_failing(TransportError::status(429, "slow down")));
        let client = client(transport, unlimited());

        let err = client
            .execute(KEY, &request(), CallOptions::default().retries(1))
            .await
            .unwrap_err();

        assert!(matches!(err, ExternalCallError::RateLimitExceeded { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn local_rejection_without_retries_fails_immediately() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(SlidingWindowRateLimiter::new(
            RateLimitConfig::new().with_rule(KEY, RateLimitRule::new(1, Duration::from_secs(30))),
        ));
        let transport = Arc::new(MockTransport::always_ok(json!([])));
        let client = client(transport.clone(), limiter);

        client.execute(KEY, &request(), CallOptions::default().retries(0)).await.unwrap();
        let err = client
            .execute(KEY, &request(), CallOptions::default().retries(0))
            .await
            .unwrap_err();

        match err {
            ExternalCallError::RateLimitExceeded { retry_after, attempts, .. } => {
                assert!(retry_after > Duration::ZERO);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_rejection_with_retries_waits_for_next_slot() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(SlidingWindowRateLimiter::new(
            RateLimitConfig::new().with_rule(KEY, RateLimitRule::new(1, Duration::from_secs(2))),
        ));
        let transport = Arc::new(MockTransport::always_ok(json!([])));
        let client = client(transport.clone(), limiter);

        client.execute(KEY, &request(), CallOptions::default()).await.unwrap();
        let response = client.execute(KEY, &request(), CallOptions::default()).await.unwrap();

        assert_eq!(response.attempts, 2);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transport_times_out_as_transient() {
        let transport = Arc::new(
            MockTransport::always_ok(json!([])).with_latency(Duration::from_secs(10)),
        );
        let client = client(transport, unlimited());

        let err = client
            .execute(
                KEY,
                &request(),
                CallOptions::default().retries(0).timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExternalCallError::Transient { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn both_key_spellings_reach_the_same_endpoint() {
        let transport = Arc::new(MockTransport::always_ok(json!([])));
        let client = client(transport.clone(), unlimited());

        client.execute("owner/actor", &request(), CallOptions::default()).await.unwrap();
        client.execute("owner~actor", &request(), CallOptions::default()).await.unwrap();

        assert_eq!(
            transport.keys_called(),
            vec![ResourceKey::new("owner~actor"), ResourceKey::new("owner~actor")]
        );
    }
}
