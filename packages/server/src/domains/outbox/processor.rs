//! Outbox processor service.
//!
//! Drains `outbox_entries` into the job queue:
//!
//! ```text
//! OutboxProcessor
//!     │
//!     ├─► lease pending entries, oldest first (attempts += 1, committed)
//!     └─► for each entry, outside any transaction:
//!             dispatch (bounded by dispatch_timeout)
//!               ├─ ok  → processed_at = NOW()
//!               └─ err → last_error, lease released, stays pending
//! ```
//!
//! Delivery is at-least-once. If the store fails between a dispatch and its
//! mark, only that entry is dispatched again, once its lease runs out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domains::outbox::models::OutboxEntry;
use crate::kernel::service_host::Service;
use crate::kernel::JobDispatcher;

/// Configuration for the outbox processor.
#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    /// Maximum number of entries claimed per poll
    pub batch_size: i64,
    /// Sleep between polls when nothing is pending
    pub poll_interval: Duration,
    /// Upper bound on a single queue handoff
    pub dispatch_timeout: Duration,
    /// How long claimed entries are hidden from other processors.
    /// Must exceed `batch_size` handoffs at `dispatch_timeout` each.
    pub claim_lease: Duration,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            dispatch_timeout: Duration::from_secs(5),
            claim_lease: Duration::from_secs(10 * 60),
        }
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub dispatched: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn claimed(&self) -> usize {
        self.dispatched + self.failed
    }
}

pub struct OutboxProcessor {
    pool: PgPool,
    dispatcher: Arc<dyn JobDispatcher>,
    config: OutboxProcessorConfig,
}

impl OutboxProcessor {
    pub fn new(pool: PgPool, dispatcher: Arc<dyn JobDispatcher>, config: OutboxProcessorConfig) -> Self {
        Self {
            pool,
            dispatcher,
            config,
        }
    }

    /// Lease one batch of pending entries and hand each to the queue.
    ///
    /// Dispatch failures are recorded on the entry and counted in the
    /// report. Store errors are returned; entries already marked stay marked
    /// and the rest are retried when their lease expires.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let entries = OutboxEntry::claim_pending(self.config.batch_size, self.config.claim_lease, &self.pool)
            .await
            .context("failed to claim pending outbox entries")?;

        let mut report = BatchReport::default();

        for entry in &entries {
            match self.dispatch(entry).await {
                Ok(()) => {
                    OutboxEntry::mark_processed(entry.outbox_id, &self.pool)
                        .await
                        .with_context(|| format!("failed to mark outbox entry {} processed", entry.outbox_id))?;
                    debug!(
                        outbox_id = %entry.outbox_id,
                        entity_id = %entry.entity_id,
                        queue = %entry.queue_name,
                        "outbox entry dispatched"
                    );
                    report.dispatched += 1;
                }
                Err(e) => {
                    warn!(
                        outbox_id = %entry.outbox_id,
                        entity_id = %entry.entity_id,
                        queue = %entry.queue_name,
                        attempts = entry.attempts,
                        error = %e,
                        "outbox dispatch failed"
                    );
                    OutboxEntry::record_failure(entry.outbox_id, &format!("{:#}", e), &self.pool)
                        .await
                        .with_context(|| format!("failed to record outbox entry {} failure", entry.outbox_id))?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn dispatch(&self, entry: &OutboxEntry) -> Result<()> {
        let job = entry.to_dispatched_job();
        let timeout = self.config.dispatch_timeout;

        tokio::time::timeout(timeout, self.dispatcher.dispatch(&job))
            .await
            .map_err(|_| anyhow::anyhow!("dispatch timed out after {:?}", timeout))?
    }
}

#[async_trait::async_trait]
impl Service for OutboxProcessor {
    fn name(&self) -> &'static str {
        "outbox-processor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox processor starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let idle = match self.process_batch().await {
                Ok(report) => {
                    if report.claimed() > 0 {
                        debug!(
                            dispatched = report.dispatched,
                            failed = report.failed,
                            "outbox batch processed"
                        );
                    }
                    // A full batch means more may be waiting.
                    (report.claimed() as i64) < self.config.batch_size
                }
                Err(e) => {
                    error!(error = %e, "outbox poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!("outbox processor stopped");
        Ok(())
    }
}
