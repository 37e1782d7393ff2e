// Main entry point for the listing analysis server

use std::sync::Arc;

use analysis_core::domains::analysis::{HeuristicAnalyzer, ListingFetcher, ValidationPolicy};
use analysis_core::kernel::jobs::{
    DispatcherConfig, ExpiryCleaner, JobDispatcher, JobStore, JobStoreConfig, PostgresJobStore,
};
use analysis_core::kernel::{
    ApifyTransport, ExternalCallClient, PostgresRateLimiter, RateLimiter, RetryPolicy,
    ServiceHost, SlidingWindowRateLimiter,
};
use analysis_core::server::{build_app, AppState, CreateRateLimit, HttpService};
use analysis_core::{Config, RateLimitBackend};
use anyhow::{Context, Result};
use apify_client::ApifyClient;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,analysis_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting listing analysis server");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let validation = match config.allowed_listing_hosts.clone() {
        Some(hosts) => ValidationPolicy::with_allowed_hosts(hosts),
        None => ValidationPolicy::default(),
    };
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(
        pool.clone(),
        JobStoreConfig::default()
            .with_ttl(config.job_ttl)
            .with_validation(validation),
    ));

    let fetcher = Arc::new(build_fetcher(&config, &pool));
    let analyzer = Arc::new(HeuristicAnalyzer::new());

    let mut host = ServiceHost::new();
    for n in 0..config.dispatcher_count {
        let dispatcher_config = DispatcherConfig {
            poll_interval: config.poll_interval,
            pipeline_timeout: config.pipeline_timeout,
            shutdown_grace: config.shutdown_grace,
            analysis_retry: RetryPolicy::new(0, config.external_base_backoff),
            worker_id: format!("dispatcher-{}-{}", std::process::id(), n),
        };
        host = host.with_service(JobDispatcher::new(
            store.clone(),
            fetcher.clone(),
            analyzer.clone(),
            dispatcher_config,
        ));
    }
    host = host.with_service(ExpiryCleaner::new(store.clone(), config.cleanup_interval));

    let state = AppState::new(store, Some(pool), config.default_max_retries);
    let app = build_app(state, CreateRateLimit::default())?;

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);
    host = host.with_service(HttpService::bind(&addr, app).await?);

    host.run_until_shutdown().await
}

fn build_fetcher(config: &Config, pool: &sqlx::PgPool) -> ListingFetcher {
    let Some(token) = config.apify_api_token.clone() else {
        tracing::warn!("APIFY_API_TOKEN not set; listings will use synthetic data");
        return ListingFetcher::synthetic_only();
    };

    let limiter: Arc<dyn RateLimiter> = match config.rate_limit_backend {
        RateLimitBackend::Memory => {
            Arc::new(SlidingWindowRateLimiter::new(config.rate_limits.clone()))
        }
        RateLimitBackend::Postgres => Arc::new(PostgresRateLimiter::new(
            pool.clone(),
            config.rate_limits.clone(),
        )),
    };

    let transport = ApifyTransport::new(ApifyClient::new(token))
        .with_run_timeout(config.external_timeout);
    let policy = RetryPolicy {
        max_retries: config.external_max_retries,
        base_backoff: config.external_base_backoff,
        ..RetryPolicy::default()
    };
    let client = ExternalCallClient::new(Arc::new(transport), limiter, policy)
        .with_default_timeout(config.external_timeout);

    ListingFetcher::new(Arc::new(client), config.scraper_actor_id.as_str())
}
