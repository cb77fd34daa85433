use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

/// Durable first-writer-wins record of an initialization result.
///
/// The key is claimed at the start of the initialization transaction and the
/// serialized result is stored before commit, so a committed row always
/// carries a result.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub entity_id: String,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    /// Claim a key for the current transaction.
    ///
    /// Returns `false` when another writer already holds a live record. A
    /// concurrent uncommitted claim blocks this call until that writer
    /// commits (→ `false`) or rolls back (→ `true`). Expired records are
    /// reclaimed.
    pub async fn claim(
        idempotency_key: &str,
        entity_id: &str,
        expires_at: Option<DateTime<Utc>>,
        conn: &mut PgConnection,
    ) -> sqlx::Result<bool> {
        let claimed = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO idempotency_records (idempotency_key, entity_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET entity_id = EXCLUDED.entity_id,
                result = NULL,
                created_at = NOW(),
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_records.expires_at IS NOT NULL
              AND idempotency_records.expires_at <= NOW()
            RETURNING idempotency_key
            "#,
        )
        .bind(idempotency_key)
        .bind(entity_id)
        .bind(expires_at)
        .fetch_optional(conn)
        .await?;

        Ok(claimed.is_some())
    }

    /// Attach the serialized result to a claimed key.
    pub async fn store_result(
        idempotency_key: &str,
        result: &serde_json::Value,
        conn: &mut PgConnection,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE idempotency_records SET result = $2 WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .bind(result)
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn find_by_key(idempotency_key: &str, pool: &PgPool) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM idempotency_records WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .fetch_optional(pool)
            .await
    }

    /// Delete expired records. State, event and outbox rows are untouched.
    pub async fn purge_expired(pool: &PgPool) -> sqlx::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM idempotency_records WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
        )
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
