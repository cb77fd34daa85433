use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::kernel::DispatchedJob;

/// A job waiting to be handed to the queue.
///
/// `processed_at = None` means pending. A pending row with `claimed_until`
/// in the future is being dispatched by some processor. Rows are kept after
/// dispatch for audit and consumer-side redelivery checks.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub outbox_id: Uuid,
    pub entity_id: String,
    pub queue_name: String,
    pub job_data: serde_json::Value,
    pub job_options: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Columns the initialization transaction supplies for a new entry.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub outbox_id: Uuid,
    pub entity_id: String,
    pub queue_name: String,
    pub job_data: serde_json::Value,
    pub job_options: Option<serde_json::Value>,
}

impl OutboxEntry {
    /// Insert a pending entry. A duplicate `outbox_id` fails with a unique
    /// violation; it never overwrites.
    pub async fn insert(entry: &NewOutboxEntry, conn: &mut PgConnection) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO outbox_entries (outbox_id, entity_id, queue_name, job_data, job_options)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(entry.outbox_id)
        .bind(&entry.entity_id)
        .bind(&entry.queue_name)
        .bind(&entry.job_data)
        .bind(&entry.job_options)
        .fetch_one(conn)
        .await
    }

    pub async fn find_by_id(outbox_id: Uuid, pool: &PgPool) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM outbox_entries WHERE outbox_id = $1")
            .bind(outbox_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_for_entity(entity_id: &str, pool: &PgPool) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM outbox_entries WHERE entity_id = $1 ORDER BY created_at ASC, outbox_id ASC",
        )
        .bind(entity_id)
        .fetch_all(pool)
        .await
    }

    pub async fn count_pending(pool: &PgPool) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM outbox_entries WHERE processed_at IS NULL",
        )
        .fetch_one(pool)
        .await
    }

    /// Lease up to `limit` pending entries, oldest first.
    ///
    /// A single statement: the attempt is counted and the lease committed
    /// before any dispatch starts. Rows leased by another processor are
    /// skipped until `claimed_until` passes, so an entry whose processor died
    /// mid-dispatch is picked up again.
    pub async fn claim_pending(limit: i64, lease: Duration, pool: &PgPool) -> sqlx::Result<Vec<Self>> {
        let mut entries = sqlx::query_as::<_, Self>(
            r#"
            UPDATE outbox_entries o
            SET attempts = o.attempts + 1,
                last_attempt_at = NOW(),
                claimed_until = NOW() + make_interval(secs => $2)
            FROM (
                SELECT outbox_id
                FROM outbox_entries
                WHERE processed_at IS NULL
                  AND (claimed_until IS NULL OR claimed_until <= NOW())
                ORDER BY created_at ASC, outbox_id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            ) due
            WHERE o.outbox_id = due.outbox_id
            RETURNING o.*
            "#,
        )
        .bind(limit)
        .bind(lease.as_secs_f64())
        .fetch_all(pool)
        .await?;

        // RETURNING order is unspecified.
        entries.sort_by(|a, b| (a.created_at, a.outbox_id).cmp(&(b.created_at, b.outbox_id)));
        Ok(entries)
    }

    /// Record a successful handoff.
    pub async fn mark_processed(outbox_id: Uuid, pool: &PgPool) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_entries
            SET processed_at = NOW(),
                claimed_until = NULL
            WHERE outbox_id = $1
            "#,
        )
        .bind(outbox_id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Record a failed handoff. The entry stays pending and is due on the next poll.
    pub async fn record_failure(outbox_id: Uuid, error: &str, pool: &PgPool) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_entries
            SET last_error = $2,
                claimed_until = NULL
            WHERE outbox_id = $1
            "#,
        )
        .bind(outbox_id)
        .bind(error)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }

    /// Payload handed to the job queue for this entry.
    pub fn to_dispatched_job(&self) -> DispatchedJob {
        DispatchedJob {
            outbox_id: self.outbox_id,
            entity_id: self.entity_id.clone(),
            queue_name: self.queue_name.clone(),
            job_data: self.job_data.clone(),
            options: self.job_options.clone(),
        }
    }
}
