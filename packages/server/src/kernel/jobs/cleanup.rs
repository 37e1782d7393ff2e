//! Periodic deletion of expired jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::store::JobStore;
use crate::kernel::service_host::Service;

/// Runs `cleanup_expired` every `interval`, independent of job state.
pub struct ExpiryCleaner {
    store: Arc<dyn JobStore>,
    interval: Duration,
}

impl ExpiryCleaner {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// One sweep. Errors are logged, never propagated.
    pub async fn sweep(&self) -> u64 {
        match self.store.cleanup_expired().await {
            Ok(0) => {
                debug!("no expired jobs");
                0
            }
            Ok(removed) => {
                info!(removed, "expired jobs removed");
                removed
            }
            Err(e) => {
                error!(error = %e, "expired job cleanup failed");
                0
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for ExpiryCleaner {
    fn name(&self) -> &'static str {
        "expiry-cleaner"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "expiry cleaner starting");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }

        info!("expiry cleaner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::kernel::jobs::{InMemoryJobStore, NewAnalysisJob};

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_each_tick_until_cancelled() {
        let store = Arc::new(InMemoryJobStore::default());
        let job = store
            .create_job(
                NewAnalysisJob::builder()
                    .token("anon_cleanup1")
                    .url("https://example.com/item/1")
                    .build(),
            )
            .await
            .unwrap();
        store
            .set_expires_at(job.id, Utc::now() - chrono::Duration::seconds(5))
            .unwrap();

        let cleaner = Box::new(ExpiryCleaner::new(store.clone(), Duration::from_secs(300)));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(cleaner.run(shutdown.clone()));

        // first tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.is_empty());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sweep_reports_count() {
        let store = Arc::new(InMemoryJobStore::default());
        let cleaner = ExpiryCleaner::new(store, Duration::from_secs(1));
        assert_eq!(cleaner.sweep().await, 0);
    }
}
