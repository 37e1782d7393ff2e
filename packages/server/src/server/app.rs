//! Application setup and server configuration.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, Method},
    routing::get,
    Router,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::domains::analysis::status::StatusQueryService;
use crate::kernel::jobs::JobStore;
use crate::kernel::service_host::Service;
use crate::server::routes::{
    create_analysis, get_analysis, get_analysis_by_token, health_handler, queue_stats_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Pinged by the health check; `None` when running without a database.
    pub db_pool: Option<PgPool>,
    pub store: Arc<dyn JobStore>,
    pub status: Arc<StatusQueryService>,
    pub default_max_retries: i32,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, db_pool: Option<PgPool>, default_max_retries: i32) -> Self {
        Self {
            db_pool,
            status: Arc::new(StatusQueryService::new(store.clone())),
            store,
            default_max_retries,
        }
    }
}

/// Per-IP quota on job creation.
#[derive(Debug, Clone, Copy)]
pub struct CreateRateLimit {
    /// Seconds to replenish one request
    pub per_second: u64,
    pub burst_size: u32,
}

impl Default for CreateRateLimit {
    fn default() -> Self {
        Self {
            per_second: 2,
            burst_size: 10,
        }
    }
}

/// Build the Axum application router
///
/// Requests must carry `ConnectInfo<SocketAddr>` (serve with
/// `into_make_service_with_connect_info`) for the per-IP create limit.
pub fn build_app(state: AppState, create_limit: CreateRateLimit) -> Result<Router> {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let governor_config = GovernorConfigBuilder::default()
        .per_second(create_limit.per_second)
        .burst_size(create_limit.burst_size)
        .use_headers()
        .finish()
        .context("invalid create rate limit configuration")?;

    let create_limit_layer = GovernorLayer {
        config: Arc::new(governor_config),
    };

    let app = Router::new()
        .route(
            "/api/analyses",
            axum::routing::post(create_analysis)
                .layer(create_limit_layer)
                .get(get_analysis_by_token),
        )
        .route("/api/analyses/:id", get(get_analysis))
        .route("/api/queue/stats", get(queue_stats_handler))
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    Ok(app)
}

/// Serves the router until shutdown.
pub struct HttpService {
    listener: TcpListener,
    app: Router,
}

impl HttpService {
    pub async fn bind(addr: &str, app: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;
        Ok(Self { listener, app })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener has no local address")
    }
}

#[async_trait]
impl Service for HttpService {
    fn name(&self) -> &'static str {
        "http-server"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let HttpService { listener, app } = *self;
        info!(addr = ?listener.local_addr().ok(), "http server listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

        Ok(())
    }
}
