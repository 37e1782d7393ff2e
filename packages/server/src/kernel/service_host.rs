//! Long-running services sharing one shutdown token.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A background service. `run` returns once `shutdown` is cancelled and the
/// service has wound down.
#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Runs a set of services until shutdown.
///
/// A service that fails cancels the token for all the others.
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    pub fn with_boxed_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Token that stops every hosted service when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until Ctrl-C or SIGTERM, then wait for every service to stop.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => {
                    info!("shutdown signal received");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });

        self.run().await
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let ServiceHost { services, shutdown } = self;
        let mut tasks = JoinSet::new();

        for service in services {
            let name = service.name();
            let token = shutdown.clone();
            info!(service = name, "service starting");
            tasks.spawn(async move { (name, service.run(token).await) });
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(service = name, "service stopped"),
                Ok((name, Err(e))) => {
                    error!(service = name, error = %e, "service failed");
                    shutdown.cancel();
                    first_error.get_or_insert(e.context(format!("service {name} failed")));
                }
                Err(e) => {
                    error!(error = %e, "service task panicked");
                    shutdown.cancel();
                    first_error.get_or_insert(anyhow!("service task panicked: {e}"));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
