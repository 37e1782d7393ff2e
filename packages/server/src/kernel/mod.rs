//! Kernel module - job orchestration infrastructure and external seams.

pub mod apify_transport;
pub mod external;
pub mod jobs;
pub mod rate_limit;
pub mod resource_key;
pub mod service_host;
pub mod test_dependencies;

pub use apify_transport::ApifyTransport;
pub use external::{
    BaseExternalTransport, CallOptions, ExternalCallClient, ExternalCallError, ExternalRequest,
    ExternalResponse, RetryPolicy, TransportError,
};
pub use rate_limit::{
    PostgresRateLimiter, RateDecision, RateLimitConfig, RateLimitError, RateLimitRule,
    RateLimiter, SlidingWindowRateLimiter,
};
pub use resource_key::ResourceKey;
pub use service_host::{Service, ServiceHost};
pub use test_dependencies::{MockPipelineStep, MockTransport};
