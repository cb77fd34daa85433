//! Idempotent, atomic entity initialization.
//!
//! # Protocol
//!
//! ```text
//! handle(cmd)
//!     │
//!     ├─► validate (no store touched on failure)
//!     ├─► cache get idempotency:{key} ── hit ──► return (from_cache = true)
//!     │         (error / timeout = miss)
//!     └─► BEGIN
//!           ├─► claim idempotency key ── taken ──► ROLLBACK, re-read winner (from_cache = true)
//!           ├─► upsert fsm_states
//!           ├─► append fsm_events
//!           ├─► insert outbox_entries (one per job)
//!           ├─► store result on idempotency record
//!         COMMIT ──► best-effort cache set ──► return (from_cache = false)
//! ```
//!
//! A cached result never outlives the idempotency record it came from, so
//! once a record expires every replica goes back to the database.
//!
//! Concurrent callers sharing a key serialize on the idempotency row: the
//! first to claim it does the writes, every other caller blocks until that
//! transaction commits and then returns the committed result.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domains::fsm::commands::InitializeCommand;
use crate::domains::fsm::errors::InitError;
use crate::domains::fsm::models::{FsmEvent, FsmState, IdempotencyRecord};
use crate::domains::outbox::models::{NewOutboxEntry, OutboxEntry};
use crate::kernel::{idempotency_cache_key, CacheError, IdempotencyCache};

/// Tunables for [`InitializeHandler`].
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// How long a result stays in the fast cache, capped by the record's expiry.
    pub cache_ttl: Duration,
    /// Upper bound on any single cache call.
    pub cache_timeout: Duration,
    /// Upper bound on the write transaction.
    pub transaction_timeout: Duration,
    /// Lifetime of the durable idempotency record. `None` keeps it forever.
    pub record_ttl: Option<Duration>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            cache_timeout: Duration::from_millis(200),
            transaction_timeout: Duration::from_secs(10),
            record_ttl: None,
        }
    }
}

/// What the idempotency record and the cache store for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeSnapshot {
    pub fsm_state: FsmState,
    pub outbox_entries: Vec<OutboxEntry>,
}

impl InitializeSnapshot {
    fn into_result(self, from_cache: bool) -> InitializeResult {
        InitializeResult {
            fsm_state: self.fsm_state,
            outbox_entries: self.outbox_entries,
            from_cache,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    pub fsm_state: FsmState,
    pub outbox_entries: Vec<OutboxEntry>,
    /// `true` when this call replayed an earlier call's result.
    pub from_cache: bool,
}

enum WriteOutcome {
    Created {
        snapshot: InitializeSnapshot,
        expires_at: Option<DateTime<Utc>>,
    },
    AlreadyClaimed,
}

/// Cache lifetime for a result whose durable record expires at `expires_at`.
/// `None` when the record has already expired and the result must not be cached.
fn bounded_cache_ttl(cache_ttl: Duration, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    match expires_at {
        None => Some(cache_ttl),
        Some(at) => {
            let remaining = (at - now).to_std().ok().filter(|d| !d.is_zero())?;
            Some(remaining.min(cache_ttl))
        }
    }
}

/// Entry point shared by the API path, the stalled-entity scan and job consumers.
#[derive(Clone)]
pub struct InitializeHandler {
    pool: PgPool,
    cache: Arc<dyn IdempotencyCache>,
    config: HandlerConfig,
}

impl InitializeHandler {
    pub fn new(pool: PgPool, cache: Arc<dyn IdempotencyCache>, config: HandlerConfig) -> Self {
        Self { pool, cache, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the entity's state, first event and outbox entries exactly once per idempotency key.
    pub async fn handle(&self, command: InitializeCommand) -> Result<InitializeResult, InitError> {
        command.validate()?;

        let cache_key = idempotency_cache_key(&command.idempotency_key);

        if let Some(snapshot) = self.read_cache(&cache_key).await {
            debug!(
                entity_id = %command.entity_id,
                idempotency_key = %command.idempotency_key,
                "idempotency cache hit"
            );
            return Ok(snapshot.into_result(true));
        }

        let timeout = self.config.transaction_timeout;
        let outcome = tokio::time::timeout(timeout, self.write_transaction(&command))
            .await
            .map_err(|_| InitError::Timeout(timeout))??;

        match outcome {
            WriteOutcome::Created { snapshot, expires_at } => {
                info!(
                    entity_id = %command.entity_id,
                    state = %snapshot.fsm_state.state,
                    initiated_by = %command.initiated_by,
                    jobs = snapshot.outbox_entries.len(),
                    "entity initialized"
                );
                self.write_cache(&cache_key, &snapshot, expires_at).await;
                Ok(snapshot.into_result(false))
            }
            WriteOutcome::AlreadyClaimed => {
                let (snapshot, expires_at) = self.read_committed(&command).await?;
                debug!(
                    entity_id = %command.entity_id,
                    idempotency_key = %command.idempotency_key,
                    "idempotency key already claimed, returning committed result"
                );
                self.write_cache(&cache_key, &snapshot, expires_at).await;
                Ok(snapshot.into_result(true))
            }
        }
    }

    async fn write_transaction(&self, command: &InitializeCommand) -> Result<WriteOutcome, InitError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(format!("{}ms", self.config.transaction_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        let expires_at = self
            .config
            .record_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));

        let claimed = IdempotencyRecord::claim(
            &command.idempotency_key,
            &command.entity_id,
            expires_at,
            &mut *tx,
        )
        .await?;

        if !claimed {
            tx.rollback().await?;
            return Ok(WriteOutcome::AlreadyClaimed);
        }

        let new_entries: Vec<NewOutboxEntry> = command
            .jobs
            .iter()
            .map(|job| NewOutboxEntry {
                outbox_id: job.outbox_id.unwrap_or_else(Uuid::now_v7),
                entity_id: command.entity_id.clone(),
                queue_name: job.queue.clone(),
                job_data: job.data.clone(),
                job_options: job.options.clone(),
            })
            .collect();

        let fsm_state = FsmState::upsert(
            &command.entity_id,
            &command.initial_state,
            &command.data,
            &mut *tx,
        )
        .await?;

        let event_data = serde_json::json!({
            "user_id": command.user_id,
            "organization_id": command.organization_id,
            "idempotency_key": command.idempotency_key,
            "outbox_ids": new_entries.iter().map(|e| e.outbox_id).collect::<Vec<_>>(),
        });

        FsmEvent::append(
            &command.entity_id,
            &command.initial_state,
            command.initiated_by,
            &event_data,
            &mut *tx,
        )
        .await?;

        let mut outbox_entries = Vec::with_capacity(new_entries.len());
        for entry in &new_entries {
            outbox_entries.push(OutboxEntry::insert(entry, &mut *tx).await?);
        }

        let snapshot = InitializeSnapshot {
            fsm_state,
            outbox_entries,
        };

        IdempotencyRecord::store_result(
            &command.idempotency_key,
            &serde_json::to_value(&snapshot)?,
            &mut *tx,
        )
        .await?;

        tx.commit().await?;

        Ok(WriteOutcome::Created { snapshot, expires_at })
    }

    /// Result written by whichever caller claimed the key first, with the
    /// record's expiry.
    async fn read_committed(
        &self,
        command: &InitializeCommand,
    ) -> Result<(InitializeSnapshot, Option<DateTime<Utc>>), InitError> {
        let record = IdempotencyRecord::find_by_key(&command.idempotency_key, &self.pool).await?;

        if let Some(record) = &record {
            if let Some(result) = record.result.clone() {
                return Ok((serde_json::from_value(result)?, record.expires_at));
            }
        }

        // Record gone (purged) or unreadable: fall back to the state row.
        let entity_id = record
            .map(|r| r.entity_id)
            .unwrap_or_else(|| command.entity_id.clone());

        warn!(
            entity_id = %entity_id,
            idempotency_key = %command.idempotency_key,
            "idempotency record has no result, falling back to state row"
        );

        let fsm_state = FsmState::find_by_entity(&entity_id, &self.pool)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        // Nothing durable backs this snapshot, so it is not cached.
        let already_expired = Some(Utc::now());
        Ok((
            InitializeSnapshot {
                fsm_state,
                outbox_entries: Vec::new(),
            },
            already_expired,
        ))
    }

    async fn read_cache(&self, key: &str) -> Option<InitializeSnapshot> {
        let timeout = self.config.cache_timeout;
        let lookup = match tokio::time::timeout(timeout, self.cache.get(key)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };

        let decoded = lookup.and_then(|raw| match raw {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(CacheError::from),
            None => Ok(None),
        });

        match decoded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(key = %key, error = %e, "idempotency cache read failed, treating as miss");
                None
            }
        }
    }

    async fn write_cache(&self, key: &str, snapshot: &InitializeSnapshot, expires_at: Option<DateTime<Utc>>) {
        let Some(ttl) = bounded_cache_ttl(self.config.cache_ttl, expires_at, Utc::now()) else {
            debug!(key = %key, "idempotency record already expired, skipping cache write");
            return;
        };

        let value = match serde_json::to_string(snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to encode idempotency cache value");
                return;
            }
        };

        let timeout = self.config.cache_timeout;
        let result = match tokio::time::timeout(timeout, self.cache.set(key, value, ttl)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };

        if let Err(e) = result {
            warn!(key = %key, error = %e, "idempotency cache write failed");
        }
    }
}
