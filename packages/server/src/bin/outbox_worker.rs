// Outbox worker: drains the outbox into NATS and runs the fallback detectors

use std::sync::Arc;

use anyhow::{Context, Result};
use outbox_core::domains::fallback::SqlStalledEntityFinder;
use outbox_core::kernel::{
    start_scheduler, MokaCache, NatsJobDispatcher, ServerDeps, ServiceHost, StalledScanTask,
};
use outbox_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,outbox_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting outbox worker");

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let nats = async_nats::connect(&config.nats_url)
        .await
        .context("Failed to connect to NATS")?;
    tracing::info!(url = %config.nats_url, "NATS connected");

    let deps = ServerDeps::new(
        pool.clone(),
        Arc::new(MokaCache::new(config.cache_capacity)),
        Arc::new(NatsJobDispatcher::new(nats)),
    );

    let stalled_scan = config.stalled_entity_query.clone().map(|query| StalledScanTask {
        handler: deps.initialize_handler(config.handler.clone()),
        finder: Arc::new(SqlStalledEntityFinder::new(pool.clone(), query)),
        config: config.stalled_scan.clone(),
    });
    if stalled_scan.is_none() {
        tracing::warn!("STALLED_ENTITY_QUERY not set, stalled entity scan disabled");
    }

    let mut scheduler = start_scheduler(pool, stalled_scan)
        .await
        .context("Failed to start scheduler")?;

    let result = ServiceHost::new()
        .with_service(deps.outbox_processor(config.outbox.clone()))
        .run_until_shutdown()
        .await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "scheduler shutdown failed");
    }

    tracing::info!("Outbox worker stopped");
    result
}
