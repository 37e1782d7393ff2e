//! Listing analysis: creation rules, result payloads, pipeline phases and the
//! status view served to clients.

pub mod fetch;
pub mod models;
pub mod pipeline;
pub mod status;
pub mod validation;

pub use fetch::{FetchOutcome, ListingFetcher};
pub use models::{AnalysisResult, DataSource, ListingAnalysis, ListingData};
pub use pipeline::{HeuristicAnalyzer, PipelineStep, StepError};
pub use status::{JobStatusView, StatusError, StatusQueryService};
pub use validation::{FieldViolation, ValidationErrors, ValidationPolicy};
