use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::domains::fsm::errors::InitError;
use crate::domains::fsm::models::InitiatedBy;

/// One job to enqueue alongside the state record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub queue: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    /// Caller-chosen outbox id. A fresh UUIDv7 is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_id: Option<Uuid>,
}

impl JobSpec {
    pub fn new(queue: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            queue: queue.into(),
            data,
            options: None,
            outbox_id: None,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_outbox_id(mut self, outbox_id: Uuid) -> Self {
        self.outbox_id = Some(outbox_id);
        self
    }
}

/// Create the state record for an entity together with its initial jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[serde(rename_all = "camelCase")]
pub struct InitializeCommand {
    pub entity_id: String,
    pub user_id: String,
    pub organization_id: String,
    pub idempotency_key: String,
    #[builder(default = InitiatedBy::Api)]
    pub initiated_by: InitiatedBy,
    pub initial_state: String,
    #[builder(default = empty_object())]
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
    #[builder(default)]
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl InitializeCommand {
    /// Reject the command before any store is touched.
    pub fn validate(&self) -> Result<(), InitError> {
        let required = [
            ("entity_id", &self.entity_id),
            ("user_id", &self.user_id),
            ("organization_id", &self.organization_id),
            ("idempotency_key", &self.idempotency_key),
            ("initial_state", &self.initial_state),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(InitError::Validation(format!("{} is required", field)));
            }
        }

        let mut outbox_ids = HashSet::new();
        for (index, job) in self.jobs.iter().enumerate() {
            if job.queue.trim().is_empty() {
                return Err(InitError::Validation(format!("jobs[{}].queue is required", index)));
            }
            if let Some(id) = job.outbox_id {
                if !outbox_ids.insert(id) {
                    return Err(InitError::Validation(format!(
                        "jobs[{}].outbox_id {} is duplicated",
                        index, id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Same command, submitted from a different layer.
    pub fn with_initiated_by(mut self, initiated_by: InitiatedBy) -> Self {
        self.initiated_by = initiated_by;
        self
    }
}
