//! Worker dispatcher: claims jobs and drives them through the pipeline.
//!
//! ```text
//!        poll tick
//!   Idle ─────────► Claiming ──none──► Idle
//!                      │
//!                      └─job──► Executing(job)
//!                                  │ initializing   5%
//!                                  │ fetching      15% ─► ListingFetcher (rate-limited, falls back
//!                                  │                      unless the scraper rejects the listing)
//!                                  │ analyzing     65% ─► PipelineStep (retried from job budget)
//!                                  │               90%
//!                                  │ finalizing    95% ─► complete_job (100%)
//!                                  └─► Idle
//!
//!   shutdown: stop claiming, give the in-flight job `shutdown_grace`, then
//!   fail it (retryable) if it is still going.
//! ```
//!
//! Each dispatcher runs one job at a time. Several dispatchers may share a
//! store; the store's atomic claim is the only coordination between them.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{AnalysisJob, FailureDetails, FailureKind, JobMetrics, JobStep};
use super::store::{JobStore, JobStoreError, Result as StoreResult};
use crate::domains::analysis::fetch::ListingFetcher;
use crate::domains::analysis::models::AnalysisResult;
use crate::domains::analysis::pipeline::PipelineStep;
use crate::kernel::external::RetryPolicy;
use crate::kernel::service_host::Service;

/// Observable dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Claiming,
    Executing { job_id: Uuid },
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Time between claim attempts
    pub poll_interval: Duration,
    /// Outer deadline for one job's whole pipeline
    pub pipeline_timeout: Duration,
    /// How long an in-flight job may keep running after shutdown starts
    pub shutdown_grace: Duration,
    /// Backoff between analysis retries; the budget comes from the job
    pub analysis_retry: RetryPolicy,
    /// Recorded on claimed jobs
    pub worker_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            pipeline_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
            analysis_retry: RetryPolicy::new(0, Duration::from_secs(1)),
            worker_id: format!("dispatcher-{}", Uuid::new_v4()),
        }
    }
}

impl DispatcherConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Why a pipeline run ended without a result.
#[derive(Debug, Clone)]
pub struct PipelineFailure {
    pub kind: FailureKind,
    pub message: String,
    pub is_retryable: bool,
}

impl PipelineFailure {
    fn new(kind: FailureKind, message: impl Into<String>, is_retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            is_retryable,
        }
    }
}

impl From<JobStoreError> for PipelineFailure {
    fn from(e: JobStoreError) -> Self {
        PipelineFailure::new(FailureKind::Internal, format!("job store error: {e}"), true)
    }
}

/// Step and retry count of the job being executed. Survives the pipeline
/// future being dropped on timeout or shutdown.
#[derive(Debug, Default)]
struct ExecutionTrace {
    step: Mutex<JobStep>,
    retries: AtomicI32,
}

impl ExecutionTrace {
    fn step(&self) -> JobStep {
        *self.step.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_step(&self, step: JobStep) {
        *self.step.lock().unwrap_or_else(|e| e.into_inner()) = step;
    }

    fn retries(&self) -> i32 {
        self.retries.load(Ordering::SeqCst)
    }

    fn add_retries(&self, n: i32) {
        self.retries.fetch_add(n, Ordering::SeqCst);
    }
}

pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    fetcher: Arc<ListingFetcher>,
    analyzer: Arc<dyn PipelineStep>,
    config: DispatcherConfig,
    state: watch::Sender<DispatcherState>,
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<ListingFetcher>,
        analyzer: Arc<dyn PipelineStep>,
        config: DispatcherConfig,
    ) -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            store,
            fetcher,
            analyzer,
            config,
            state,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.send_replace(state);
    }

    /// Claim one job and run it to a terminal state.
    ///
    /// Returns the id of the job handled, or `None` when nothing was claimable.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> StoreResult<Option<Uuid>> {
        if shutdown.is_cancelled() {
            self.set_state(DispatcherState::ShuttingDown);
            return Ok(None);
        }

        self.set_state(DispatcherState::Claiming);
        let claimed = match self.store.claim_next_pending(&self.config.worker_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.set_state(DispatcherState::Idle);
                return Err(e);
            }
        };

        let Some(job) = claimed else {
            self.set_state(DispatcherState::Idle);
            return Ok(None);
        };

        let job_id = job.id;
        debug!(job_id = %job_id, worker_id = %self.config.worker_id, "job claimed");
        self.set_state(DispatcherState::Executing { job_id });

        self.execute(job, shutdown).await;

        self.set_state(if shutdown.is_cancelled() {
            DispatcherState::ShuttingDown
        } else {
            DispatcherState::Idle
        });
        Ok(Some(job_id))
    }

    async fn execute(&self, job: AnalysisJob, shutdown: &CancellationToken) {
        let trace = ExecutionTrace::default();
        let started = Instant::now();

        let pipeline = AssertUnwindSafe(self.run_pipeline(&job, &trace, started)).catch_unwind();
        let bounded = tokio::time::timeout(self.config.pipeline_timeout, pipeline);
        tokio::pin!(bounded);

        let finished = tokio::select! {
            res = &mut bounded => Some(res),
            _ = shutdown.cancelled() => {
                self.set_state(DispatcherState::ShuttingDown);
                info!(
                    job_id = %job.id,
                    grace_secs = self.config.shutdown_grace.as_secs(),
                    "shutdown requested, waiting for in-flight job"
                );
                tokio::time::timeout(self.config.shutdown_grace, &mut bounded).await.ok()
            }
        };

        let outcome = match finished {
            Some(Ok(Ok(outcome))) => outcome,
            Some(Ok(Err(panic))) => Err(PipelineFailure::new(
                FailureKind::Panic,
                format!("pipeline panicked: {}", panic_message(panic.as_ref())),
                true,
            )),
            Some(Err(_elapsed)) => Err(PipelineFailure::new(
                FailureKind::Timeout,
                format!(
                    "pipeline timed out after {}s",
                    self.config.pipeline_timeout.as_secs()
                ),
                true,
            )),
            None => Err(PipelineFailure::new(
                FailureKind::Shutdown,
                "shutdown grace period elapsed before the job finished",
                true,
            )),
        };

        self.report(&job, &trace, outcome).await;
    }

    async fn run_pipeline(
        &self,
        job: &AnalysisJob,
        trace: &ExecutionTrace,
        started: Instant,
    ) -> std::result::Result<(AnalysisResult, JobMetrics), PipelineFailure> {
        self.advance(job.id, 5, JobStep::Initializing, trace).await?;

        self.advance(job.id, 15, JobStep::Fetching, trace).await?;
        let budget = job.remaining_retries();
        let fetched = match self.fetcher.fetch(&job.url, budget as u32).await {
            Ok(fetched) => fetched,
            Err(e) => {
                trace.add_retries(e.retries() as i32);
                return Err(PipelineFailure::new(
                    FailureKind::External,
                    e.to_string(),
                    e.is_retryable(),
                ));
            }
        };
        trace.add_retries(fetched.retries as i32);

        self.advance(job.id, 65, JobStep::Analyzing, trace).await?;
        let mut analysis_attempt: u32 = 0;
        let analysis = loop {
            match self.analyzer.analyze(&fetched.listing, fetched.source).await {
                Ok(analysis) => break analysis,
                Err(e) if e.is_retryable() && trace.retries() < job.max_retries => {
                    let delay = self.config.analysis_retry.delay_for(analysis_attempt, None);
                    trace.add_retries(1);
                    analysis_attempt += 1;
                    warn!(
                        job_id = %job.id,
                        step = self.analyzer.name(),
                        attempt = analysis_attempt,
                        retry_count = trace.retries(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "analysis failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(PipelineFailure::new(
                        FailureKind::Analysis,
                        e.to_string(),
                        e.is_retryable(),
                    ))
                }
            }
        };

        self.advance(job.id, 90, JobStep::Analyzing, trace).await?;
        self.advance(job.id, 95, JobStep::Finalizing, trace).await?;

        let metrics = JobMetrics {
            retry_count: trace.retries(),
            duration_ms: started.elapsed().as_millis() as i64,
            data_source: fetched.source,
        };
        let result = AnalysisResult {
            listing: fetched.listing,
            analysis,
            data_source: fetched.source,
        };
        Ok((result, metrics))
    }

    async fn advance(
        &self,
        job_id: Uuid,
        progress: i32,
        step: JobStep,
        trace: &ExecutionTrace,
    ) -> std::result::Result<(), PipelineFailure> {
        trace.set_step(step);
        self.store.update_progress(job_id, progress, step).await?;
        debug!(job_id = %job_id, progress, step = step.as_str(), "job progress");
        Ok(())
    }

    async fn report(
        &self,
        job: &AnalysisJob,
        trace: &ExecutionTrace,
        outcome: std::result::Result<(AnalysisResult, JobMetrics), PipelineFailure>,
    ) {
        let failure = match outcome {
            Ok((result, metrics)) => {
                match self.store.complete_job(job.id, result, metrics).await {
                    Ok(done) => {
                        info!(
                            job_id = %job.id,
                            retry_count = done.retry_count,
                            duration_ms = metrics.duration_ms,
                            data_source = metrics.data_source.as_str(),
                            "job completed"
                        );
                        return;
                    }
                    Err(JobStoreError::InvalidResult(reason)) => PipelineFailure::new(
                        FailureKind::Internal,
                        format!("pipeline produced an invalid result: {reason}"),
                        true,
                    ),
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "failed to record job completion");
                        PipelineFailure::new(
                            FailureKind::Internal,
                            format!("failed to record job completion: {e}"),
                            true,
                        )
                    }
                }
            }
            Err(failure) => failure,
        };

        let details = FailureDetails::new(failure.kind, trace.step(), trace.retries());
        match self
            .store
            .fail_job(job.id, &failure.message, details, failure.is_retryable)
            .await
        {
            Ok(_) => warn!(
                job_id = %job.id,
                step = trace.step().as_str(),
                retry_count = trace.retries(),
                is_retryable = failure.is_retryable,
                error = %failure.message,
                "job failed"
            ),
            Err(e) => error!(job_id = %job.id, error = %e, "failed to record job failure"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait::async_trait]
impl Service for JobDispatcher {
    fn name(&self) -> &'static str {
        "job-dispatcher"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "dispatcher starting"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.run_once(&shutdown).await {
                error!(worker_id = %self.config.worker_id, error = %e, "failed to claim job");
            }
        }

        self.set_state(DispatcherState::ShuttingDown);
        info!(worker_id = %self.config.worker_id, "dispatcher stopped");
        Ok(())
    }
}
