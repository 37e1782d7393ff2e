//! Test harness with testcontainers for integration testing.
//!
//! Uses one shared Postgres container across all tests. The container is
//! started on first use; each harness then gets its own freshly migrated
//! database, since dispatchers claim the oldest pending job in the table.

use anyhow::{Context, Result};
use sqlx::{Connection, PgConnection, PgPool};
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use analysis_core::kernel::jobs::{JobStoreConfig, PostgresJobStore};

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    /// Server URL without a database name
    server_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let server_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        Ok(Self {
            server_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }

    /// Each test runs on its own runtime, so admin connections are not pooled.
    async fn admin(&self, statement: &str) -> Result<()> {
        let mut conn = PgConnection::connect(&format!("{}/postgres", self.server_url))
            .await
            .context("Failed to connect to Postgres")?;
        sqlx::query(statement).execute(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }
}

/// Test harness with a private, migrated database on the shared container.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let store = ctx.job_store();
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
    pub database_name: String,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
        let infra = SharedTestInfra::get().await;
        let _ = infra
            .admin(&format!("DROP DATABASE IF EXISTS {}", self.database_name))
            .await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let database_name = format!("analysis_test_{}", Uuid::new_v4().simple());
        infra
            .admin(&format!("CREATE DATABASE {database_name}"))
            .await
            .context("Failed to create test database")?;

        let db_pool = PgPool::connect(&format!("{}/{}", infra.server_url, database_name))
            .await
            .context("Failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_pool,
            database_name,
        })
    }

    pub fn job_store(&self) -> PostgresJobStore {
        PostgresJobStore::new(self.db_pool.clone(), JobStoreConfig::default())
    }

    pub fn job_store_with(&self, config: JobStoreConfig) -> PostgresJobStore {
        PostgresJobStore::new(self.db_pool.clone(), config)
    }
}
