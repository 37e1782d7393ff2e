// Listing Analysis - API Core
//
// This crate accepts listing URLs, queues an analysis job per request, and
// runs jobs in background dispatchers that fetch listing data through a
// rate-limited scraping client.
//
// Job infrastructure lives in kernel/; listing semantics live in domains/.

pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
