//! Apify-backed transport for the external call client.

use std::time::Duration;

use apify_client::{ApifyClient, ApifyError};
use async_trait::async_trait;
use serde_json::Value;

use super::external::{BaseExternalTransport, ExternalRequest, ExternalResponse, TransportError};
use super::resource_key::ResourceKey;

/// Runs the actor named by the resource key synchronously and returns its
/// dataset items as a JSON array.
pub struct ApifyTransport {
    client: ApifyClient,
    run_timeout_secs: u64,
}

impl ApifyTransport {
    pub fn new(client: ApifyClient) -> Self {
        Self {
            client,
            run_timeout_secs: 120,
        }
    }

    /// Platform-side run timeout passed on every call.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_secs = timeout.as_secs().max(1);
        self
    }
}

#[async_trait]
impl BaseExternalTransport for ApifyTransport {
    async fn send(
        &self,
        resource_key: &ResourceKey,
        request: &ExternalRequest,
    ) -> Result<ExternalResponse, TransportError> {
        let items: Vec<Value> = self
            .client
            .run_actor_sync(resource_key.as_str(), &request.input, self.run_timeout_secs)
            .await
            .map_err(map_apify_error)?;

        Ok(ExternalResponse::ok(Value::Array(items)))
    }
}

fn map_apify_error(err: ApifyError) -> TransportError {
    match err {
        ApifyError::Api {
            status,
            message,
            retry_after_secs,
        } => TransportError::Status {
            status,
            message,
            retry_after: retry_after_secs.map(Duration::from_secs),
        },
        ApifyError::Http(e) => match e.status() {
            Some(status) => TransportError::status(status.as_u16(), e.to_string()),
            None => TransportError::Network(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_keeps_status_and_retry_after() {
        let mapped = map_apify_error(ApifyError::Api {
            status: 429,
            message: "rate limit".into(),
            retry_after_secs: Some(12),
        });

        match mapped {
            TransportError::Status {
                status,
                retry_after,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after, Some(Duration::from_secs(12)));
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn client_error_stays_fatal() {
        let mapped = map_apify_error(ApifyError::Api {
            status: 401,
            message: "bad token".into(),
            retry_after_secs: None,
        });
        assert!(!mapped.is_retryable());
    }

    #[test]
    fn platform_errors_are_retryable() {
        let mapped = map_apify_error(ApifyError::Api {
            status: 502,
            message: "actor run failed".into(),
            retry_after_secs: None,
        });
        assert!(mapped.is_retryable());
    }
}
