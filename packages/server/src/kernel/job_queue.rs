//! Job queue collaborator the outbox processor hands jobs to.
//!
//! Provides a trait-based dispatcher so the processor can run against NATS in
//! production and a recording mock in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The payload handed to the job queue for one outbox entry.
///
/// Delivery is at-least-once. Consumers must treat `outbox_id` as their
/// dedup key (see [`crate::domains::outbox::ConsumedJob`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedJob {
    pub outbox_id: Uuid,
    pub entity_id: String,
    pub queue_name: String,
    pub job_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Accepts a job or reports a transient failure.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: &DispatchedJob) -> Result<()>;
}

/// NATS subject a queue's jobs are published on.
pub fn subject_for(queue_name: &str) -> String {
    format!("jobs.{}", queue_name)
}

/// Publishes jobs to NATS under `jobs.{queue_name}`.
pub struct NatsJobDispatcher {
    client: async_nats::Client,
}

impl NatsJobDispatcher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobDispatcher for NatsJobDispatcher {
    async fn dispatch(&self, job: &DispatchedJob) -> Result<()> {
        let payload = serde_json::to_vec(job)?;
        self.client
            .publish(subject_for(&job.queue_name), Bytes::from(payload))
            .await?;
        // Surface connection loss now instead of on the next poll.
        self.client.flush().await?;
        Ok(())
    }
}

/// Mock dispatcher that records jobs for test assertions.
///
/// Call [`TestJobDispatcher::set_failing`] to simulate an unreachable queue.
#[derive(Default)]
pub struct TestJobDispatcher {
    dispatched: RwLock<Vec<DispatchedJob>>,
    failing: AtomicBool,
}

impl TestJobDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher that rejects every job until toggled back.
    pub fn failing() -> Self {
        let dispatcher = Self::default();
        dispatcher.set_failing(true);
        dispatcher
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn dispatched(&self) -> Vec<DispatchedJob> {
        self.dispatched
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn dispatched_to(&self, queue_name: &str) -> Vec<DispatchedJob> {
        self.dispatched
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|job| job.queue_name == queue_name)
            .cloned()
            .collect()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl JobDispatcher for TestJobDispatcher {
    async fn dispatch(&self, job: &DispatchedJob) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("queue unreachable: {}", subject_for(&job.queue_name)));
        }

        self.dispatched
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(job.clone());
        Ok(())
    }
}
