//! Read-only status projection for clients.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::models::AnalysisResult;
use crate::kernel::jobs::{AnalysisJob, JobStatus, JobStep, JobStore, QueueStats, StoreResult};

/// Error shown to a client polling a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusError {
    pub message: String,
    /// Retryable failure with budget left; resubmitting may succeed.
    pub can_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: i32,
    pub current_step: JobStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
    /// Completed from synthetic data.
    pub degraded: bool,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl JobStatusView {
    pub fn project(job: AnalysisJob, now: DateTime<Utc>) -> Self {
        let estimated_time_remaining_ms = estimate_remaining_ms(&job, now);
        let degraded = job.result.as_ref().is_some_and(AnalysisResult::is_degraded);
        let error = match (job.status, &job.error_info) {
            (JobStatus::Failed, Some(info)) => Some(StatusError {
                message: info.message.clone(),
                can_retry: info.is_retryable && job.retry_count < job.max_retries,
            }),
            _ => None,
        };
        let result = match job.status {
            JobStatus::Completed => job.result,
            _ => None,
        };

        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            current_step: job.current_step,
            estimated_time_remaining_ms,
            result,
            error,
            degraded,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            expires_at: job.expires_at,
        }
    }
}

/// `elapsed * (100 - progress) / progress`, only while running with progress made.
fn estimate_remaining_ms(job: &AnalysisJob, now: DateTime<Utc>) -> Option<i64> {
    if job.status != JobStatus::Running || job.progress <= 0 {
        return None;
    }
    let elapsed_ms = (now - job.started_at?).num_milliseconds().max(0);
    let progress = i64::from(job.progress.min(100));
    Some(elapsed_ms * (100 - progress) / progress)
}

pub struct StatusQueryService {
    store: Arc<dyn JobStore>,
}

impl StatusQueryService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, job_id: Uuid) -> StoreResult<Option<JobStatusView>> {
        let job = self.store.get_by_id(job_id).await?;
        Ok(job.map(|j| JobStatusView::project(j, Utc::now())))
    }

    pub async fn get_status_by_token(&self, token: &str) -> StoreResult<Option<JobStatusView>> {
        let job = self.store.get_by_token(token).await?;
        Ok(job.map(|j| JobStatusView::project(j, Utc::now())))
    }

    pub async fn queue_stats(&self) -> StoreResult<QueueStats> {
        self.store.get_queue_stats().await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::domains::analysis::models::{DataSource, ListingAnalysis, ListingData};
    use crate::kernel::jobs::{ErrorInfo, FailureDetails, FailureKind, NewAnalysisJob};

    fn job(status: JobStatus) -> AnalysisJob {
        let now = Utc::now();
        let mut job = AnalysisJob::pending(
            NewAnalysisJob::builder()
                .token("anon_12345678")
                .url("https://example.com/item/1")
                .build(),
            now,
            Duration::hours(24),
        );
        job.status = status;
        job
    }

    fn result(source: DataSource) -> AnalysisResult {
        AnalysisResult {
            listing: ListingData {
                url: "https://example.com/item/1".into(),
                title: "Lamp".into(),
                ..Default::default()
            },
            analysis: ListingAnalysis {
                score: 40,
                findings: vec![],
                recommendations: vec![],
            },
            data_source: source,
        }
    }

    fn failed(is_retryable: bool, retry_count: i32, max_retries: i32) -> AnalysisJob {
        let mut j = job(JobStatus::Failed);
        j.retry_count = retry_count;
        j.max_retries = max_retries;
        j.error_info = Some(ErrorInfo {
            message: "scrape failed".into(),
            details: FailureDetails::new(FailureKind::Analysis, JobStep::Analyzing, retry_count),
            is_retryable,
        });
        j
    }

    #[test]
    fn eta_scales_elapsed_by_remaining_ratio() {
        let now = Utc::now();
        let mut j = job(JobStatus::Running);
        j.started_at = Some(now - Duration::seconds(10));
        j.progress = 25;

        let view = JobStatusView::project(j, now);
        assert_eq!(view.estimated_time_remaining_ms, Some(30_000));
    }

    #[test]
    fn no_eta_before_progress_or_outside_running() {
        let now = Utc::now();
        let mut running = job(JobStatus::Running);
        running.started_at = Some(now);
        assert_eq!(JobStatusView::project(running, now).estimated_time_remaining_ms, None);
        assert_eq!(JobStatusView::project(job(JobStatus::Pending), now).estimated_time_remaining_ms, None);
    }

    #[test]
    fn can_retry_needs_retryable_and_budget() {
        let now = Utc::now();
        let view = |j| JobStatusView::project(j, now).error.unwrap().can_retry;

        assert!(view(failed(true, 1, 2)));
        assert!(!view(failed(true, 2, 2)));
        assert!(!view(failed(false, 0, 2)));
    }

    #[test]
    fn completed_view_carries_result_and_degraded_flag() {
        let now = Utc::now();
        let mut j = job(JobStatus::Completed);
        j.result = Some(result(DataSource::Synthetic));

        let view = JobStatusView::project(j, now);
        assert!(view.degraded);
        assert!(view.result.is_some());
        assert!(view.error.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"]["dataSource"], "synthetic");
        assert!(json.get("estimatedTimeRemainingMs").is_none());
    }

    #[tokio::test]
    async fn service_reads_through_store() {
        use crate::kernel::jobs::InMemoryJobStore;

        let store = Arc::new(InMemoryJobStore::default());
        let created = store
            .create_job(
                NewAnalysisJob::builder()
                    .token("anon_status01")
                    .url("https://example.com/item/9")
                    .build(),
            )
            .await
            .unwrap();
        let service = StatusQueryService::new(store);

        let view = service.get_status(created.id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.progress, 0);

        let by_token = service.get_status_by_token("anon_status01").await.unwrap().unwrap();
        assert_eq!(by_token.job_id, created.id);
        assert!(service.get_status(Uuid::now_v7()).await.unwrap().is_none());
    }
}
