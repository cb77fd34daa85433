//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! ```text
//! Scheduler
//!     │
//!     ├─► every hour       → purge expired idempotency records
//!     └─► every 5 minutes  → stalled entity scan (when a finder is configured)
//!             └─► For each candidate → InitializeHandler (initiated_by = system)
//! ```

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::domains::fallback::{run_stalled_scan, StalledEntityFinder, StalledScanConfig};
use crate::domains::fsm::{IdempotencyRecord, InitializeHandler};

/// Layer 2 detector wiring.
pub struct StalledScanTask {
    pub handler: InitializeHandler,
    pub finder: Arc<dyn StalledEntityFinder>,
    pub config: StalledScanConfig,
}

/// Start all scheduled tasks
pub async fn start_scheduler(pool: PgPool, stalled_scan: Option<StalledScanTask>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let purge_pool = pool.clone();
    let purge_job = Job::new_async("0 0 * * * *", move |_uuid, _lock| {
        let pool = purge_pool.clone();
        Box::pin(async move {
            if let Err(e) = run_idempotency_purge(&pool).await {
                tracing::error!(error = %e, "idempotency purge task failed");
            }
        })
    })?;

    scheduler.add(purge_job).await?;

    let scan_enabled = stalled_scan.is_some();
    if let Some(task) = stalled_scan {
        let task = Arc::new(task);
        let scan_job = Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
            let task = task.clone();
            Box::pin(async move {
                if let Err(e) = run_stalled_scan(&task.handler, task.finder.as_ref(), &task.config).await {
                    tracing::error!(error = %e, "stalled entity scan failed");
                }
            })
        })?;

        scheduler.add(scan_job).await?;
    }

    scheduler.start().await?;

    tracing::info!(
        stalled_scan = scan_enabled,
        "scheduled tasks started (idempotency purge every hour)"
    );
    Ok(scheduler)
}

/// Delete idempotency records whose `expires_at` has passed.
///
/// State, event and outbox rows are never touched.
async fn run_idempotency_purge(pool: &PgPool) -> Result<()> {
    let purged = IdempotencyRecord::purge_expired(pool).await?;

    if purged > 0 {
        tracing::info!(purged, "purged expired idempotency records");
    }

    Ok(())
}
