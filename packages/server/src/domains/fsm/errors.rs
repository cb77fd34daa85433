use std::time::Duration;

use thiserror::Error;

/// Errors returned by the initialization command handler.
///
/// Every variant is safe to retry with the same command: the handler is
/// idempotent on the command's idempotency key.
#[derive(Error, Debug)]
pub enum InitError {
    /// Missing or malformed command field. Nothing was written.
    #[error("invalid command: {0}")]
    Validation(String),

    /// The transaction aborted. Nothing was committed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The transaction did not finish in time and was rolled back.
    #[error("initialization timed out after {0:?}")]
    Timeout(Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InitError {
    /// Validation failures repeat on retry; everything else may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InitError::Validation(_))
    }

    /// Unique-constraint violation, e.g. a caller-supplied `outbox_id` that already exists.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            InitError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}
