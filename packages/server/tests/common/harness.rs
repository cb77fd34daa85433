//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared by every test in the binary. It is
//! started and migrated on first use, then reused. Tests isolate themselves
//! by using unique entity ids and idempotency keys.

use std::sync::Arc;

use anyhow::{Context, Result};
use outbox_core::domains::fsm::{HandlerConfig, InitializeHandler};
use outbox_core::domains::outbox::{OutboxProcessor, OutboxProcessorConfig};
use outbox_core::kernel::{IdempotencyCache, MokaCache, TestJobDispatcher};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=outbox_core=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=300"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
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
}

/// Per-test context.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &mut TestHarness) {
///     let result = ctx.handler().handle(command).await.unwrap();
/// }
/// ```
pub struct TestHarness {
    /// Connection string for tests that need their own pool.
    pub db_url: String,
    pub db_pool: PgPool,
    /// In-memory cache shared by every handler this harness builds.
    pub cache: Arc<MokaCache>,
    pub dispatcher: Arc<TestJobDispatcher>,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_pool = PgPoolOptions::new()
            .max_connections(50)
            .connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;

        Ok(Self {
            db_url: infra.db_url.clone(),
            db_pool,
            cache: Arc::new(MokaCache::new(1_000)),
            dispatcher: Arc::new(TestJobDispatcher::new()),
        })
    }

    /// Handler backed by the harness cache with default config.
    pub fn handler(&self) -> InitializeHandler {
        self.handler_with(self.cache.clone(), HandlerConfig::default())
    }

    pub fn handler_with(&self, cache: Arc<dyn IdempotencyCache>, config: HandlerConfig) -> InitializeHandler {
        InitializeHandler::new(self.db_pool.clone(), cache, config)
    }

    /// Processor dispatching into the harness's [`TestJobDispatcher`].
    pub fn processor(&self) -> OutboxProcessor {
        OutboxProcessor::new(
            self.db_pool.clone(),
            self.dispatcher.clone(),
            OutboxProcessorConfig {
                batch_size: 1_000,
                ..Default::default()
            },
        )
    }
}
