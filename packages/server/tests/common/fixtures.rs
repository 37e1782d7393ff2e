//! Test fixtures: tokens, listing payloads and a wired-up dispatcher rig.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use analysis_core::domains::analysis::{
    AnalysisResult, DataSource, HeuristicAnalyzer, ListingData, ListingFetcher, PipelineStep,
};
use analysis_core::kernel::jobs::{
    DispatcherConfig, InMemoryJobStore, JobDispatcher, JobMetrics, JobStore, NewAnalysisJob,
};
use analysis_core::kernel::{
    ExternalCallClient, MockPipelineStep, MockTransport, RateLimitConfig, RetryPolicy,
    SlidingWindowRateLimiter,
};

pub const SCRAPER_KEY: &str = "apify/e-commerce-scraping-tool";

/// Token that no other test uses.
pub fn unique_token() -> String {
    format!("tok_{}", Uuid::new_v4().simple())
}

pub fn listing_url(slug: &str) -> String {
    format!("https://shop.example.com/products/{slug}")
}

pub fn new_job(token: &str, url: &str, max_retries: i32) -> NewAnalysisJob {
    NewAnalysisJob::builder()
        .token(token)
        .url(url)
        .max_retries(max_retries)
        .build()
}

/// Dataset body as the scraping actor returns it.
pub fn scraped_body(url: &str) -> Value {
    json!([{
        "url": url,
        "title": "Trail Running Shoe",
        "description": "Lightweight shoe with a grippy outsole for wet rock.",
        "brand": { "name": "Northwind" },
        "offers": { "price": "89.99", "priceCurrency": "USD", "availability": "https://schema.org/InStock" },
        "aggregateRating": { "ratingValue": 4.4, "reviewCount": 212 },
        "image": ["https://cdn.example.com/shoe-1.jpg", "https://cdn.example.com/shoe-2.jpg"]
    }])
}

/// A valid result for completing jobs by hand.
pub async fn sample_result(url: &str) -> AnalysisResult {
    let listing = ListingData {
        url: url.to_string(),
        title: "Trail Running Shoe".to_string(),
        price: Some(89.99),
        ..Default::default()
    };
    let analysis = HeuristicAnalyzer::new()
        .analyze(&listing, DataSource::Scraped)
        .await
        .expect("heuristic analysis of a titled listing succeeds");
    AnalysisResult {
        listing,
        analysis,
        data_source: DataSource::Scraped,
    }
}

pub fn sample_metrics(retry_count: i32) -> JobMetrics {
    JobMetrics {
        retry_count,
        duration_ms: 1_250,
        data_source: DataSource::Scraped,
    }
}

/// In-memory store, scripted transport and scripted analysis step wired into
/// dispatchers the same way the server binary wires the real ones.
pub struct DispatcherRig {
    pub store: Arc<InMemoryJobStore>,
    pub transport: Arc<MockTransport>,
    pub analyzer: Arc<MockPipelineStep>,
    pub fetcher: Arc<ListingFetcher>,
}

impl DispatcherRig {
    pub fn new(transport: MockTransport, analyzer: MockPipelineStep) -> Self {
        let transport = Arc::new(transport);
        let client = ExternalCallClient::new(
            transport.clone(),
            Arc::new(SlidingWindowRateLimiter::new(RateLimitConfig::new())),
            RetryPolicy::new(3, Duration::from_millis(100)),
        )
        .with_default_timeout(Duration::from_secs(10));

        Self {
            store: Arc::new(InMemoryJobStore::default()),
            transport,
            analyzer: Arc::new(analyzer),
            fetcher: Arc::new(ListingFetcher::new(Arc::new(client), SCRAPER_KEY)),
        }
    }

    /// Transport that always returns a good listing.
    pub fn healthy(analyzer: MockPipelineStep) -> Self {
        Self::new(
            MockTransport::always_ok(scraped_body(&listing_url("shoe"))),
            analyzer,
        )
    }

    pub fn config(worker_id: &str) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(50),
            pipeline_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            analysis_retry: RetryPolicy::new(0, Duration::from_millis(100)),
            worker_id: worker_id.to_string(),
        }
    }

    pub fn dispatcher(&self, config: DispatcherConfig) -> JobDispatcher {
        let store: Arc<dyn JobStore> = self.store.clone();
        let analyzer: Arc<dyn PipelineStep> = self.analyzer.clone();
        JobDispatcher::new(store, self.fetcher.clone(), analyzer, config)
    }
}
