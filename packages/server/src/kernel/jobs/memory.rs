//! In-process job store for tests and local runs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::{
    AnalysisJob, ErrorInfo, FailureDetails, JobMetrics, JobStatus, JobStep, NewAnalysisJob,
    QueueStats,
};
use super::store::{
    check_progress, check_result, start_of_utc_day, JobStore, JobStoreConfig, JobStoreError,
    Result,
};
use crate::domains::analysis::models::AnalysisResult;

/// Every operation takes the single write lock, so each transition is atomic
/// with respect to every other.
pub struct InMemoryJobStore {
    config: JobStoreConfig,
    jobs: RwLock<HashMap<Uuid, AnalysisJob>>,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(JobStoreConfig::default())
    }
}

impl InMemoryJobStore {
    pub fn new(config: JobStoreConfig) -> Self {
        Self {
            config,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Move a job's expiry, e.g. to exercise cleanup.
    pub fn set_expires_at(&self, job_id: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.expires_at = expires_at;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_running<F>(&self, job_id: Uuid, f: F) -> Result<AnalysisJob>
    where
        F: FnOnce(&mut AnalysisJob) -> Result<()>,
    {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Err(JobStoreError::InvalidState {
                job_id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }
        f(job)?;
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob> {
        let new = self.config.check_new(new)?;
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        let token_live = jobs
            .values()
            .any(|j| j.token == new.token && !j.status.is_terminal());
        if token_live {
            return Err(JobStoreError::TokenInUse);
        }

        let job = AnalysisJob::pending(new, Utc::now(), self.config.ttl);
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<AnalysisJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        let next = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.expires_at > now)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.current_step = JobStep::Initializing;
        job.started_at = Some(now);
        job.claimed_by = Some(worker_id.to_string());
        Ok(Some(job.clone()))
    }

    async fn update_progress(&self, job_id: Uuid, progress: i32, step: JobStep) -> Result<()> {
        check_progress(progress)?;
        self.with_running(job_id, |job| {
            if progress < job.progress {
                return Err(JobStoreError::ProgressRegression {
                    job_id,
                    current: job.progress,
                    requested: progress,
                });
            }
            job.progress = progress;
            job.current_step = step;
            Ok(())
        })
        .map(|_| ())
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: AnalysisResult,
        metrics: JobMetrics,
    ) -> Result<AnalysisJob> {
        check_result(&result)?;
        self.with_running(job_id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.current_step = JobStep::Finalizing;
            job.retry_count = metrics.retry_count;
            job.result = Some(result);
            job.completed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        message: &str,
        details: FailureDetails,
        is_retryable: bool,
    ) -> Result<AnalysisJob> {
        self.with_running(job_id, |job| {
            job.status = JobStatus::Failed;
            job.retry_count = details.retry_count;
            job.error_info = Some(ErrorInfo {
                message: message.to_string(),
                details,
                is_retryable,
            });
            job.completed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<AnalysisJob>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs
            .values()
            .filter(|j| j.token == token)
            .max_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn get_by_id(&self, job_id: Uuid) -> Result<Option<AnalysisJob>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(&job_id).cloned())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, j| !j.is_expired(now));
        Ok((before - jobs.len()) as u64)
    }

    async fn get_queue_stats(&self) -> Result<QueueStats> {
        let today = start_of_utc_day(Utc::now());
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());

        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            if job.created_at >= today {
                stats.total_today += 1;
            }
        }
        Ok(stats)
    }
}
