use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::kernel::rate_limit::RateLimitConfig;

/// One year.
const MAX_JOB_TTL_HOURS: u64 = 24 * 365;

/// Which rate limiter backs external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitBackend {
    /// Per-process sliding window
    Memory,
    /// Fixed window shared through the database
    Postgres,
}

impl FromStr for RateLimitBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" => Ok(Self::Postgres),
            other => bail!("unknown rate limit backend '{other}' (expected memory or postgres)"),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub apify_api_token: Option<String>,
    pub scraper_actor_id: String,
    pub job_ttl: chrono::Duration,
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    pub pipeline_timeout: Duration,
    pub shutdown_grace: Duration,
    pub dispatcher_count: usize,
    pub default_max_retries: i32,
    pub external_timeout: Duration,
    pub external_max_retries: u32,
    pub external_base_backoff: Duration,
    pub rate_limits: RateLimitConfig,
    pub rate_limit_backend: RateLimitBackend,
    pub allowed_listing_hosts: Option<Vec<String>>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parsed = |key: &str, default: &str| -> Result<u64> {
            let raw = lookup(key).unwrap_or_else(|| default.to_string());
            raw.trim()
                .parse::<u64>()
                .with_context(|| format!("{key} must be a non-negative integer, got '{raw}'"))
        };

        let positive = |key: &str, default: &str| -> Result<u64> {
            let value = parsed(key, default)?;
            if value == 0 {
                bail!("{key} must be at least 1");
            }
            Ok(value)
        };

        let dispatcher_count = positive("DISPATCHER_COUNT", "1")? as usize;

        let job_ttl_hours = positive("JOB_TTL_HOURS", "24")?;
        if job_ttl_hours > MAX_JOB_TTL_HOURS {
            bail!("JOB_TTL_HOURS must be at most {MAX_JOB_TTL_HOURS}");
        }

        let default_max_retries = parsed("DEFAULT_MAX_RETRIES", "2")?;
        if default_max_retries > 10 {
            bail!("DEFAULT_MAX_RETRIES must be at most 10");
        }

        let rate_limits = match lookup("RATE_LIMITS") {
            Some(raw) if !raw.trim().is_empty() => {
                RateLimitConfig::from_json(&raw).context("RATE_LIMITS must be a JSON object of {limit, windowMs}")?
            }
            _ => RateLimitConfig::new(),
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: lookup("PORT")
                .unwrap_or_else(|| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            apify_api_token: lookup("APIFY_API_TOKEN").filter(|t| !t.trim().is_empty()),
            scraper_actor_id: lookup("SCRAPER_ACTOR_ID")
                .unwrap_or_else(|| "apify/e-commerce-scraping-tool".to_string()),
            job_ttl: chrono::Duration::hours(job_ttl_hours as i64),
            poll_interval: Duration::from_secs(positive("POLL_INTERVAL_SECS", "5")?),
            cleanup_interval: Duration::from_secs(positive("CLEANUP_INTERVAL_SECS", "300")?),
            pipeline_timeout: Duration::from_secs(positive("PIPELINE_TIMEOUT_SECS", "300")?),
            shutdown_grace: Duration::from_secs(parsed("SHUTDOWN_GRACE_SECS", "30")?),
            dispatcher_count,
            default_max_retries: default_max_retries as i32,
            external_timeout: Duration::from_millis(parsed("EXTERNAL_TIMEOUT_MS", "60000")?),
            external_max_retries: parsed("EXTERNAL_MAX_RETRIES", "3")? as u32,
            external_base_backoff: Duration::from_millis(parsed("EXTERNAL_BASE_BACKOFF_MS", "1000")?),
            rate_limits,
            rate_limit_backend: lookup("RATE_LIMIT_BACKEND")
                .unwrap_or_else(|| "memory".to_string())
                .parse()?,
            allowed_listing_hosts: lookup("ALLOWED_LISTING_HOSTS").map(|raw| {
                raw.split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect()
            }),
        })
    }
}
