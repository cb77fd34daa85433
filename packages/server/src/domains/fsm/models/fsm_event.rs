use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

/// Who triggered a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "initiated_by", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum InitiatedBy {
    /// Synchronous call from the API layer
    Api,
    /// Job consumer that found its entity uninitialized
    Worker,
    /// Periodic stalled-entity scan
    System,
}

impl std::fmt::Display for InitiatedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitiatedBy::Api => write!(f, "API"),
            InitiatedBy::Worker => write!(f, "WORKER"),
            InitiatedBy::System => write!(f, "SYSTEM"),
        }
    }
}

/// Append-only transition log entry
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsmEvent {
    pub id: i64,
    pub entity_id: String,
    pub to_state: String,
    pub initiated_by: InitiatedBy,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl FsmEvent {
    /// Append a transition. Must run inside the transaction that causes it.
    pub async fn append(
        entity_id: &str,
        to_state: &str,
        initiated_by: InitiatedBy,
        event_data: &serde_json::Value,
        conn: &mut PgConnection,
    ) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO fsm_events (entity_id, to_state, initiated_by, event_data)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(entity_id)
        .bind(to_state)
        .bind(initiated_by)
        .bind(event_data)
        .fetch_one(conn)
        .await
    }

    /// All transitions for an entity in commit order (for audit and replay)
    pub async fn list_for_entity(entity_id: &str, pool: &PgPool) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM fsm_events WHERE entity_id = $1 ORDER BY id ASC")
            .bind(entity_id)
            .fetch_all(pool)
            .await
    }

    pub async fn count_for_entity(entity_id: &str, pool: &PgPool) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM fsm_events WHERE entity_id = $1")
            .bind(entity_id)
            .fetch_one(pool)
            .await
    }
}
