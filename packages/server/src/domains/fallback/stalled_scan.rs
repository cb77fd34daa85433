//! Periodic scan for entities whose initialization never happened.
//!
//! Catches entities the API path created but never initialized, e.g. because
//! the caller crashed between creating the entity and calling the handler.
//! Each candidate is resubmitted through [`InitializeHandler`] with its
//! original idempotency key, so a candidate that was initialized in the
//! meantime is a replay, not a second write.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::domains::fsm::{FsmState, InitializeCommand, InitializeHandler, InitiatedBy, JobSpec};

/// Configuration for the stalled-entity scan.
#[derive(Debug, Clone)]
pub struct StalledScanConfig {
    /// How long an entity may sit uninitialized before the scan picks it up
    pub grace_period: Duration,
    /// Maximum number of candidates per scan
    pub limit: i64,
    /// State an entity is in before initialization has taken effect.
    /// Entities in any other state are left alone.
    pub pre_initialization_state: Option<String>,
}

impl Default for StalledScanConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            limit: 100,
            pre_initialization_state: None,
        }
    }
}

/// Source of entities that look stuck before initialization.
#[async_trait]
pub trait StalledEntityFinder: Send + Sync {
    /// Commands for entities created before `cutoff` that may not be initialized.
    async fn find_stalled(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<InitializeCommand>>;
}

#[derive(sqlx::FromRow)]
struct StalledEntityRow {
    entity_id: String,
    user_id: String,
    organization_id: String,
    idempotency_key: String,
    initial_state: String,
    data: Option<serde_json::Value>,
    jobs: Option<serde_json::Value>,
}

impl StalledEntityRow {
    fn into_command(self) -> Result<InitializeCommand> {
        let jobs: Vec<JobSpec> = match self.jobs {
            Some(jobs) => serde_json::from_value(jobs)
                .with_context(|| format!("invalid jobs column for entity {}", self.entity_id))?,
            None => Vec::new(),
        };

        Ok(InitializeCommand::builder()
            .entity_id(self.entity_id)
            .user_id(self.user_id)
            .organization_id(self.organization_id)
            .idempotency_key(self.idempotency_key)
            .initiated_by(InitiatedBy::System)
            .initial_state(self.initial_state)
            .data(self.data.unwrap_or_else(|| serde_json::json!({})))
            .jobs(jobs)
            .build())
    }
}

/// Finds stalled entities with an operator-supplied query.
///
/// The query receives `$1` (cutoff timestamp) and `$2` (limit) and must return
/// the columns `entity_id`, `user_id`, `organization_id`, `idempotency_key`,
/// `initial_state`, and optionally `data` and `jobs` (a JSON array of job
/// specs) as JSONB.
pub struct SqlStalledEntityFinder {
    pool: PgPool,
    query: String,
}

impl SqlStalledEntityFinder {
    pub fn new(pool: PgPool, query: impl Into<String>) -> Self {
        Self {
            pool,
            query: query.into(),
        }
    }
}

#[async_trait]
impl StalledEntityFinder for SqlStalledEntityFinder {
    async fn find_stalled(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<InitializeCommand>> {
        let rows = sqlx::query_as::<_, StalledEntityRow>(&self.query)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("stalled entity query failed")?;

        let mut commands = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_command() {
                Ok(command) => commands.push(command),
                Err(e) => warn!(error = %e, "skipping malformed stalled entity row"),
            }
        }

        Ok(commands)
    }
}

/// Outcome of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Candidates initialized by this scan
    pub submitted: usize,
    /// Candidates whose idempotency key had already been used
    pub replayed: usize,
    /// Candidates already past the pre-initialization state
    pub skipped: usize,
    pub failed: usize,
}

/// Resubmit every stalled candidate through the command handler.
///
/// Per-candidate failures are logged and counted; only a finder failure
/// aborts the scan.
pub async fn run_stalled_scan(
    handler: &InitializeHandler,
    finder: &dyn StalledEntityFinder,
    config: &StalledScanConfig,
) -> Result<ScanReport> {
    let grace = chrono::Duration::from_std(config.grace_period).context("grace period out of range")?;
    let cutoff = Utc::now() - grace;

    let candidates = finder.find_stalled(cutoff, config.limit).await?;
    let mut report = ScanReport::default();

    if candidates.is_empty() {
        debug!("no stalled entities found");
        return Ok(report);
    }

    info!(count = candidates.len(), cutoff = %cutoff, "found stalled entity candidates");

    for command in candidates {
        let entity_id = command.entity_id.clone();

        match FsmState::find_by_entity(&entity_id, handler.pool()).await {
            Ok(Some(state)) if state.has_left(config.pre_initialization_state.as_deref()) => {
                debug!(entity_id = %entity_id, state = %state.state, "entity already initialized, skipping");
                report.skipped += 1;
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "failed to load state for stalled entity");
                report.failed += 1;
                continue;
            }
        }

        match handler.handle(command.with_initiated_by(InitiatedBy::System)).await {
            Ok(result) if result.from_cache => {
                debug!(entity_id = %entity_id, "stalled entity resubmission replayed");
                report.replayed += 1;
            }
            Ok(_) => {
                info!(entity_id = %entity_id, "stalled entity initialized");
                report.submitted += 1;
            }
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "stalled entity resubmission failed");
                report.failed += 1;
            }
        }
    }

    info!(
        submitted = report.submitted,
        replayed = report.replayed,
        skipped = report.skipped,
        failed = report.failed,
        "stalled entity scan complete"
    );

    Ok(report)
}
