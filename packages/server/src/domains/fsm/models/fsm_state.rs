use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

/// Current stage of one entity. At most one row per `entity_id`.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsmState {
    pub entity_id: String,
    pub state: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FsmState {
    /// Find the state row for an entity
    pub async fn find_by_entity(entity_id: &str, pool: &PgPool) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM fsm_states WHERE entity_id = $1")
            .bind(entity_id)
            .fetch_optional(pool)
            .await
    }

    /// Insert the state row, or overwrite state/data if the entity already has one.
    ///
    /// Must run inside the initialization transaction.
    pub async fn upsert(
        entity_id: &str,
        state: &str,
        data: &serde_json::Value,
        conn: &mut PgConnection,
    ) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO fsm_states (entity_id, state, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (entity_id) DO UPDATE
            SET state = EXCLUDED.state,
                data = EXCLUDED.data,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(entity_id)
        .bind(state)
        .bind(data)
        .fetch_one(conn)
        .await
    }

    /// Count state rows for an entity (0 or 1)
    pub async fn count_for_entity(entity_id: &str, pool: &PgPool) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM fsm_states WHERE entity_id = $1")
            .bind(entity_id)
            .fetch_one(pool)
            .await
    }

    /// Whether this entity has moved past the given pre-initialization stage.
    ///
    /// With no pre-initialization stage configured, any existing row counts.
    pub fn has_left(&self, pre_initialization_state: Option<&str>) -> bool {
        match pre_initialization_state {
            Some(pre) => self.state != pre,
            None => true,
        }
    }
}
