//! Postgres job store.
//!
//! Each state transition is one `UPDATE ... WHERE status = ... RETURNING *`.
//! When it matches no row, a follow-up read only decides which error to
//! report; it never retries the write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
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

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    token: String,
    url: String,
    status: JobStatus,
    progress: i32,
    current_step: JobStep,
    retry_count: i32,
    max_retries: i32,
    result: Option<Json<AnalysisResult>>,
    error_info: Option<Json<ErrorInfo>>,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl From<JobRow> for AnalysisJob {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            token: row.token,
            url: row.url,
            status: row.status,
            progress: row.progress,
            current_step: row.current_step,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            result: row.result.map(|r| r.0),
            error_info: row.error_info.map(|e| e.0),
            claimed_by: row.claimed_by,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
        }
    }
}

pub struct PostgresJobStore {
    pool: PgPool,
    config: JobStoreConfig,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, config: JobStoreConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a guarded update on `job_id` matched nothing.
    async fn not_running_error(&self, job_id: Uuid) -> JobStoreError {
        let found = sqlx::query_as::<_, (JobStatus,)>("SELECT status FROM analysis_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await;

        match found {
            Ok(Some((actual,))) => JobStoreError::InvalidState {
                job_id,
                expected: JobStatus::Running,
                actual,
            },
            Ok(None) => JobStoreError::NotFound(job_id),
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob> {
        let new = self.config.check_new(new)?;

        // The partial unique index on live tokens turns a duplicate into a no-op.
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO analysis_jobs (
                id, token, url, status, progress, current_step,
                retry_count, max_retries, created_at, expires_at
            )
            VALUES (
                $1, $2, $3, 'pending', 0, 'initializing',
                0, $4, NOW(), NOW() + ($5 || ' milliseconds')::INTERVAL
            )
            ON CONFLICT (token) WHERE status IN ('pending', 'running') DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&new.token)
        .bind(&new.url)
        .bind(new.max_retries)
        .bind(self.config.ttl.num_milliseconds().to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(AnalysisJob::from).ok_or(JobStoreError::TokenInUse)
    }

    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<AnalysisJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE analysis_jobs
            SET status = 'running',
                current_step = 'initializing',
                started_at = NOW(),
                claimed_by = $1,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM analysis_jobs
                WHERE status = 'pending'
                  AND expires_at > NOW()
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AnalysisJob::from))
    }

    async fn update_progress(&self, job_id: Uuid, progress: i32, step: JobStep) -> Result<()> {
        check_progress(progress)?;

        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET progress = $2, current_step = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND progress <= $2
            "#,
        )
        .bind(job_id)
        .bind(progress)
        .bind(step)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }

        let current = sqlx::query_as::<_, (JobStatus, i32)>(
            "SELECT status, progress FROM analysis_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Err(match current {
            None => JobStoreError::NotFound(job_id),
            Some((JobStatus::Running, current)) => JobStoreError::ProgressRegression {
                job_id,
                current,
                requested: progress,
            },
            Some((actual, _)) => JobStoreError::InvalidState {
                job_id,
                expected: JobStatus::Running,
                actual,
            },
        })
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: AnalysisResult,
        metrics: JobMetrics,
    ) -> Result<AnalysisJob> {
        check_result(&result)?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE analysis_jobs
            SET status = 'completed',
                progress = 100,
                current_step = 'finalizing',
                retry_count = $2,
                result = $3,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(metrics.retry_count)
        .bind(Json(&result))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.not_running_error(job_id).await),
        }
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        message: &str,
        details: FailureDetails,
        is_retryable: bool,
    ) -> Result<AnalysisJob> {
        let retry_count = details.retry_count;
        let info = ErrorInfo {
            message: message.to_string(),
            details,
            is_retryable,
        };

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed',
                retry_count = $2,
                error_info = $3,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(retry_count)
        .bind(Json(&info))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.not_running_error(job_id).await),
        }
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<AnalysisJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM analysis_jobs
            WHERE token = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AnalysisJob::from))
    }

    async fn get_by_id(&self, job_id: Uuid) -> Result<Option<AnalysisJob>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM analysis_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(AnalysisJob::from))
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM analysis_jobs WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted)
    }

    async fn get_queue_stats(&self) -> Result<QueueStats> {
        let (pending, running, completed, failed, total_today) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'pending'),
                    COUNT(*) FILTER (WHERE status = 'running'),
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status = 'failed'),
                    COUNT(*) FILTER (WHERE created_at >= $1)
                FROM analysis_jobs
                "#,
            )
            .bind(start_of_utc_day(Utc::now()))
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueStats {
            pending,
            running,
            completed,
            failed,
            total_today,
        })
    }
}
