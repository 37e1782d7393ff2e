// Test doubles - scripted implementations of the external seams.
//
// Shared by unit tests and the integration tests under tests/.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::external::{BaseExternalTransport, ExternalRequest, ExternalResponse, TransportError};
use super::resource_key::ResourceKey;
use crate::domains::analysis::models::{DataSource, ListingAnalysis, ListingData};
use crate::domains::analysis::pipeline::{HeuristicAnalyzer, PipelineStep, StepError};

// =============================================================================
// Mock Transport
// =============================================================================

type TransportReply = Result<ExternalResponse, TransportError>;

/// Plays back scripted replies in order, then the fallback reply.
pub struct MockTransport {
    script: Mutex<VecDeque<TransportReply>>,
    fallback: TransportReply,
    latency: Option<Duration>,
    calls: Mutex<Vec<(ResourceKey, ExternalRequest)>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Empty script; unscripted calls fail with a network error.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Err(TransportError::Network("no scripted reply".into())),
            latency: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call succeeds with `body`.
    pub fn always_ok(body: Value) -> Self {
        Self {
            fallback: Ok(ExternalResponse::ok(body)),
            ..Self::new()
        }
    }

    /// Every call fails with `error`.
    pub fn always_failing(error: TransportError) -> Self {
        Self {
            fallback: Err(error),
            ..Self::new()
        }
    }

    pub fn with_response(self, response: ExternalResponse) -> Self {
        self.push(Ok(response))
    }

    pub fn with_failure(self, error: TransportError) -> Self {
        self.push(Err(error))
    }

    /// Delay every reply; pair with paused time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn push(mut self, reply: TransportReply) -> Self {
        self.script
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Normalized keys of every call, in order.
    pub fn keys_called(&self) -> Vec<ResourceKey> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<ExternalRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, req)| req.clone())
            .collect()
    }
}

#[async_trait]
impl BaseExternalTransport for MockTransport {
    async fn send(
        &self,
        resource_key: &ResourceKey,
        request: &ExternalRequest,
    ) -> Result<ExternalResponse, TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((resource_key.clone(), request.clone()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

// =============================================================================
// Mock Pipeline Step
// =============================================================================

#[derive(Debug, Clone)]
enum StepBehavior {
    Analyze,
    Fail(StepError),
    Panic(String),
    Hang,
}

/// Scripted analysis step. Unscripted calls use the fallback behavior,
/// which defaults to the real heuristic analysis.
pub struct MockPipelineStep {
    script: Mutex<VecDeque<StepBehavior>>,
    fallback: StepBehavior,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl Default for MockPipelineStep {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPipelineStep {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: StepBehavior::Analyze,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing(error: StepError) -> Self {
        Self {
            fallback: StepBehavior::Fail(error),
            ..Self::new()
        }
    }

    pub fn panicking(message: impl Into<String>) -> Self {
        Self {
            fallback: StepBehavior::Panic(message.into()),
            ..Self::new()
        }
    }

    /// Never returns; exercises timeouts and shutdown.
    pub fn hanging() -> Self {
        Self {
            fallback: StepBehavior::Hang,
            ..Self::new()
        }
    }

    pub fn with_failure(mut self, error: StepError) -> Self {
        self.script
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(StepBehavior::Fail(error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineStep for MockPipelineStep {
    fn name(&self) -> &'static str {
        "mock-step"
    }

    async fn analyze(
        &self,
        listing: &ListingData,
        source: DataSource,
    ) -> Result<ListingAnalysis, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match behavior {
            StepBehavior::Analyze => HeuristicAnalyzer::new().analyze(listing, source).await,
            StepBehavior::Fail(error) => Err(error),
            StepBehavior::Panic(message) => panic!("{message}"),
            StepBehavior::Hang => std::future::pending().await,
        }
    }
}
