//! Job infrastructure for listing analysis.
//!
//! - [`JobStore`] - durable job lifecycle, with [`PostgresJobStore`] and
//!   [`InMemoryJobStore`] backends
//! - [`JobDispatcher`] - long-running service that claims and executes jobs
//! - [`ExpiryCleaner`] - long-running service that deletes expired jobs
//!
//! # Architecture
//!
//! ```text
//! POST /api/analyses ─► JobStore.create_job (pending)
//!
//! JobDispatcher (xN)
//!     │
//!     ├─► JobStore.claim_next_pending   (atomic, one winner)
//!     ├─► ListingFetcher ─► ExternalCallClient ─► RateLimiter + transport
//!     ├─► PipelineStep.analyze
//!     └─► JobStore.complete_job / fail_job
//!
//! ExpiryCleaner ─► JobStore.cleanup_expired   (every cleanup interval)
//! ```

mod cleanup;
mod dispatcher;
mod job;
mod memory;
mod postgres;
mod store;

pub use cleanup::ExpiryCleaner;
pub use dispatcher::{DispatcherConfig, DispatcherState, JobDispatcher, PipelineFailure};
pub use job::{
    AnalysisJob, ErrorInfo, FailureDetails, FailureKind, JobMetrics, JobStatus, JobStep,
    NewAnalysisJob, QueueStats,
};
pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use store::{JobStore, JobStoreConfig, JobStoreError, Result as StoreResult};
