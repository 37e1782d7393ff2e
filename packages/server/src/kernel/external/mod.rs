//! Rate-limited, retrying client for external calls.
//!
//! ```text
//! ExternalCallClient::execute(key, request, options)
//!     │
//!     ├─► normalize key (owner/name -> owner~name)
//!     ├─► RateLimiter::try_acquire(key)      (re-checked every attempt)
//!     ├─► BaseExternalTransport::send        (bounded by options.timeout)
//!     └─► classify failure
//!             network / timeout / 5xx -> retry with backoff
//!             429                     -> retry, honoring server delay
//!             other 4xx               -> fatal, no retry
//! ```

mod client;
mod retry_policy;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::resource_key::ResourceKey;

pub use client::ExternalCallClient;
pub use retry_policy::RetryPolicy;

/// Payload for one external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub input: serde_json::Value,
}

impl ExternalRequest {
    pub fn new(input: serde_json::Value) -> Self {
        Self { input }
    }
}

/// Successful response from an external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub status: u16,
    pub body: serde_json::Value,
    /// Attempts it took, including the successful one. Set by the client.
    #[serde(default)]
    pub attempts: u32,
}

impl ExternalResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            body,
            attempts: 1,
        }
    }

    /// Retries spent before this response arrived.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Raw failure from a transport, before retry classification.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No response at all (connect, DNS, reset, body decode).
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a non-success status.
    #[error("status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
}

impl TransportError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        TransportError::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Network failures, 5xx and 429 may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status == 429 || is_server_error(*status),
        }
    }

    fn is_upstream_rate_limit(&self) -> bool {
        matches!(self, TransportError::Status { status: 429, .. })
    }

    fn server_delay(&self) -> Option<Duration> {
        match self {
            TransportError::Status { retry_after, .. } => *retry_after,
            TransportError::Network(_) => None,
        }
    }
}

pub(crate) fn is_server_error(status: u16) -> bool {
    (500..600).contains(&status)
}

/// Errors surfaced to callers once retries are exhausted or a failure is fatal.
#[derive(Debug, Clone, Error)]
pub enum ExternalCallError {
    /// Our own quota or the service's 429 kept rejecting us.
    #[error("rate limit exceeded for {resource_key} (retry after {}ms)", .retry_after.as_millis())]
    RateLimitExceeded {
        resource_key: ResourceKey,
        retry_after: Duration,
        attempts: u32,
    },

    /// Network failure, timeout or 5xx on every attempt.
    #[error("transient failure calling {resource_key} after {attempts} attempt(s): {message}")]
    Transient {
        resource_key: ResourceKey,
        message: String,
        attempts: u32,
    },

    /// A 4xx other than 429. Never retried.
    #[error("fatal error calling {resource_key} (status {status}): {message}")]
    Fatal {
        resource_key: ResourceKey,
        status: u16,
        message: String,
        attempts: u32,
    },
}

impl ExternalCallError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExternalCallError::Fatal { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ExternalCallError::RateLimitExceeded { attempts, .. }
            | ExternalCallError::Transient { attempts, .. }
            | ExternalCallError::Fatal { attempts, .. } => *attempts,
        }
    }

    /// Retries spent before giving up.
    pub fn retries(&self) -> u32 {
        self.attempts().saturating_sub(1)
    }
}

/// Per-call options. `None` falls back to the client's policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Sends one request to an external resource. No retries, no limits.
#[async_trait]
pub trait BaseExternalTransport: Send + Sync {
    async fn send(
        &self,
        resource_key: &ResourceKey,
        request: &ExternalRequest,
    ) -> Result<ExternalResponse, TransportError>;
}
