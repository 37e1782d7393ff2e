//! Durable job lifecycle store.
//!
//! ```text
//!            create_job
//!                │
//!                ▼
//!   ┌────────► pending ──claim_next_pending──► running ──complete_job──► completed
//!   │                                            │
//!   │                                            └──────fail_job───────► failed
//!   │
//!   └── cleanup_expired deletes any row past expires_at, whatever its status
//! ```
//!
//! Every transition is a single compare-and-set on the stored status. Calls
//! that find the job in the wrong state return [`JobStoreError::InvalidState`]
//! and change nothing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::job::{AnalysisJob, FailureDetails, JobMetrics, JobStatus, JobStep, NewAnalysisJob, QueueStats};
use crate::domains::analysis::models::AnalysisResult;
use crate::domains::analysis::validation::{ValidationErrors, ValidationPolicy};

pub type Result<T> = std::result::Result<T, JobStoreError>;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("job {job_id} is {}, expected {}", .actual.as_str(), .expected.as_str())]
    InvalidState {
        job_id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("progress for job {job_id} cannot move from {current} back to {requested}")]
    ProgressRegression {
        job_id: Uuid,
        current: i32,
        requested: i32,
    },

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("token already has a job in progress")]
    TokenInUse,

    #[error("invalid result payload: {0}")]
    InvalidResult(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl JobStoreError {
    /// True for caller mistakes, false for infrastructure failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            JobStoreError::Validation(_)
                | JobStoreError::InvalidState { .. }
                | JobStoreError::ProgressRegression { .. }
                | JobStoreError::NotFound(_)
                | JobStoreError::TokenInUse
                | JobStoreError::InvalidResult(_)
        )
    }
}

/// Policy shared by every store backend.
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// `expires_at = created_at + ttl`
    pub ttl: Duration,
    pub validation: ValidationPolicy,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
            validation: ValidationPolicy::default(),
        }
    }
}

impl JobStoreConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_validation(mut self, validation: ValidationPolicy) -> Self {
        self.validation = validation;
        self
    }

    /// Validate and normalize a creation request.
    pub fn check_new(&self, mut new: NewAnalysisJob) -> Result<NewAnalysisJob> {
        self.validation.validate(&new.token, &new.url, new.max_retries)?;
        new.url = new.url.trim().to_string();
        Ok(new)
    }
}

pub(crate) fn check_progress(progress: i32) -> Result<()> {
    if (0..=100).contains(&progress) {
        Ok(())
    } else {
        Err(ValidationErrors::single("progress", "must be between 0 and 100").into())
    }
}

pub(crate) fn check_result(result: &AnalysisResult) -> Result<()> {
    result.check().map_err(JobStoreError::InvalidResult)
}

pub(crate) fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Canonical store of analysis jobs.
///
/// One instance is built at startup and shared as `Arc<dyn JobStore>` by the
/// dispatchers, the cleaner and the status service.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate and insert a `pending` job with `progress = 0`.
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob>;

    /// Atomically move the oldest unexpired `pending` job to `running`.
    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<AnalysisJob>>;

    /// Record progress on a `running` job. Progress never moves backwards.
    async fn update_progress(&self, job_id: Uuid, progress: i32, step: JobStep) -> Result<()>;

    /// `running -> completed`, storing the result and final retry count.
    async fn complete_job(
        &self,
        job_id: Uuid,
        result: AnalysisResult,
        metrics: JobMetrics,
    ) -> Result<AnalysisJob>;

    /// `running -> failed`, storing the error info.
    async fn fail_job(
        &self,
        job_id: Uuid,
        message: &str,
        details: FailureDetails,
        is_retryable: bool,
    ) -> Result<AnalysisJob>;

    /// Most recently created job for the token.
    async fn get_by_token(&self, token: &str) -> Result<Option<AnalysisJob>>;

    async fn get_by_id(&self, job_id: Uuid) -> Result<Option<AnalysisJob>>;

    /// Delete every job whose `expires_at` has passed. Returns how many.
    async fn cleanup_expired(&self) -> Result<u64>;

    async fn get_queue_stats(&self) -> Result<QueueStats>;
}
