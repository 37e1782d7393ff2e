//! Job model for listing analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::domains::analysis::models::{AnalysisResult, DataSource};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "analysis_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// `completed` and `failed` accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Pipeline phase. Observational only; control flow never reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "analysis_job_step", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    #[default]
    Initializing,
    Fetching,
    Analyzing,
    Finalizing,
}

impl JobStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStep::Initializing => "initializing",
            JobStep::Fetching => "fetching",
            JobStep::Analyzing => "analyzing",
            JobStep::Finalizing => "finalizing",
        }
    }
}

/// What made a job fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The analysis step kept failing or failed fatally.
    Analysis,
    /// An external call failed and no fallback applied.
    External,
    /// The outer pipeline deadline elapsed.
    Timeout,
    /// The pipeline panicked.
    Panic,
    /// The process shut down before the job finished.
    Shutdown,
    /// Store or bookkeeping error while running the pipeline.
    Internal,
}

// ============================================================================
// Structured payloads
// ============================================================================

/// Structured details stored alongside a failure message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetails {
    pub kind: FailureKind,
    pub step: JobStep,
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl FailureDetails {
    pub fn new(kind: FailureKind, step: JobStep, retry_count: i32) -> Self {
        Self {
            kind,
            step,
            retry_count,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Present only when `status = failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub message: String,
    pub details: FailureDetails,
    pub is_retryable: bool,
}

/// Execution metrics reported with a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    pub retry_count: i32,
    pub duration_ms: i64,
    pub data_source: DataSource,
}

// ============================================================================
// Job
// ============================================================================

/// One tracked unit of analysis work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub id: Uuid,
    pub token: String,
    pub url: String,
    pub status: JobStatus,
    pub progress: i32,
    pub current_step: JobStep,
    pub retry_count: i32,
    pub max_retries: i32,
    pub result: Option<AnalysisResult>,
    pub error_info: Option<ErrorInfo>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl AnalysisJob {
    /// Build a fresh `pending` record.
    pub fn pending(new: NewAnalysisJob, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            id: Uuid::now_v7(),
            token: new.token,
            url: new.url,
            status: JobStatus::Pending,
            progress: 0,
            current_step: JobStep::Initializing,
            retry_count: 0,
            max_retries: new.max_retries,
            result: None,
            error_info: None,
            claimed_by: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now + ttl,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Retries left in the job's budget.
    pub fn remaining_retries(&self) -> i32 {
        (self.max_retries - self.retry_count).max(0)
    }
}

/// Input for `create_job`.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewAnalysisJob {
    pub token: String,
    pub url: String,
    #[builder(default = 2)]
    pub max_retries: i32,
}

/// Aggregate counts across the table. May lag concurrent writers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    /// Jobs created since midnight UTC.
    pub total_today: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_job_starts_at_zero_with_fixed_expiry() {
        let now = Utc::now();
        let job = AnalysisJob::pending(
            NewAnalysisJob::builder()
                .token("anon_12345678")
                .url("https://example.com/item/123")
                .build(),
            now,
            chrono::Duration::hours(24),
        );

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.current_step, JobStep::Initializing);
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.expires_at, now + chrono::Duration::hours(24));
        assert!(!job.is_expired(now));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn error_info_serializes_tagged_details() {
        let info = ErrorInfo {
            message: "analysis failed".into(),
            details: FailureDetails::new(FailureKind::Timeout, JobStep::Analyzing, 1)
                .with_cause("deadline"),
            is_retryable: true,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["details"]["kind"], "timeout");
        assert_eq!(value["details"]["step"], "analyzing");
        assert_eq!(value["isRetryable"], true);
    }
}
