//! Test fixtures: commands with unique ids and a cache that always fails.

use std::time::Duration;

use async_trait::async_trait;
use outbox_core::domains::fsm::{InitializeCommand, JobSpec};
use outbox_core::kernel::{CacheError, IdempotencyCache};
use uuid::Uuid;

/// Unique id with a readable prefix, e.g. `entity-0192…`.
pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// A command for `entity_id` keyed by `idempotency_key`, with one doc-processing job.
pub fn init_command(entity_id: &str, idempotency_key: &str) -> InitializeCommand {
    InitializeCommand::builder()
        .entity_id(entity_id)
        .user_id("u1")
        .organization_id("o1")
        .idempotency_key(idempotency_key)
        .initial_state("outline")
        .data(serde_json::json!({"title": "Quarterly report"}))
        .jobs(vec![JobSpec::new(
            "doc-proc",
            serde_json::json!({"fileId": "f1"}),
        )])
        .build()
}

/// Fresh entity id and idempotency key.
pub fn fresh_command() -> InitializeCommand {
    init_command(&unique("entity"), &unique("key"))
}

/// Cache whose every call fails, simulating an unreachable cache server.
pub struct FailingCache;

#[async_trait]
impl IdempotencyCache for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

/// Cache whose calls never complete within any reasonable timeout.
pub struct HangingCache;

#[async_trait]
impl IdempotencyCache for HangingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}
