//! Pure Apify REST API client.
//!
//! A minimal client for the Apify platform API: synchronous actor runs that
//! return the run's dataset items in one call.
//!
//! Actor identifiers are passed through as given; the API expects the
//! `owner~actor` form, so callers normalize `owner/actor` before calling.
//!
//! # Example
//!
//! ```rust,ignore
//! use apify_client::ApifyClient;
//!
//! let client = ApifyClient::new("your-api-token".into());
//!
//! let items: Vec<serde_json::Value> = client
//!     .run_actor_sync("apify~e-commerce-scraping-tool", &input, 60)
//!     .await?;
//! ```

pub mod error;
pub mod types;

pub use error::{ApifyError, Result};
pub use types::StartUrl;

use serde::de::DeserializeOwned;
use serde::Serialize;

const BASE_URL: &str = "https://api.apify.com/v2";

pub struct ApifyClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl ApifyClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Point the client at a different API root (proxies, local fakes).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Run an actor and return its dataset items in one call.
    ///
    /// Uses the `run-sync-get-dataset-items` endpoint, which blocks until the
    /// run finishes or `timeout_secs` elapses on the platform side.
    pub async fn run_actor_sync<I, T>(
        &self,
        actor_id: &str,
        input: &I,
        timeout_secs: u64,
    ) -> Result<Vec<T>>
    where
        I: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!(
            "{}/acts/{}/run-sync-get-dataset-items?timeout={}&format=json",
            self.base_url, actor_id, timeout_secs
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(input)
            .send()
            .await?;

        let resp = Self::check_status(resp).await?;
        let items: Vec<T> = resp.json().await?;
        tracing::debug!(actor_id, count = items.len(), "Actor run returned dataset items");
        Ok(items)
    }

    /// Turn a non-success response into `ApifyError::Api`, keeping any
    /// `Retry-After` hint the platform sent with a 429.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after_secs = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();

        Err(ApifyError::Api {
            status: status.as_u16(),
            message: body,
            retry_after_secs,
        })
    }
}
