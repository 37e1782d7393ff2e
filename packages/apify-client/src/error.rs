use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Apify API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        /// Seconds from a `Retry-After` header, when the platform sent one.
        retry_after_secs: Option<u64>,
    },
}

impl ApifyError {
    /// HTTP status of the failed call, if the platform answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApifyError::Api { status, .. } => Some(*status),
            ApifyError::Http(e) => e.status().map(|s| s.as_u16()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApifyError>;
