use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Consumer-side dedup ledger.
///
/// The outbox processor delivers at-least-once: a crash between the queue
/// handoff and `processed_at` being written redelivers the job. Consumers
/// that must not repeat work claim the `outbox_id` here first.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ConsumedJob {
    pub outbox_id: Uuid,
    pub consumer: String,
    pub consumed_at: DateTime<Utc>,
}

impl ConsumedJob {
    /// Returns `true` the first time `consumer` claims `outbox_id`, `false` on redelivery.
    pub async fn try_claim(outbox_id: Uuid, consumer: &str, pool: &PgPool) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumed_jobs (outbox_id, consumer)
            VALUES ($1, $2)
            ON CONFLICT (outbox_id, consumer) DO NOTHING
            "#,
        )
        .bind(outbox_id)
        .bind(consumer)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn find(outbox_id: Uuid, consumer: &str, pool: &PgPool) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM consumed_jobs WHERE outbox_id = $1 AND consumer = $2",
        )
        .bind(outbox_id)
        .bind(consumer)
        .fetch_optional(pool)
        .await
    }
}
