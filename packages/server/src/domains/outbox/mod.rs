//! Transactional outbox: pending job rows and the processor that drains them.

pub mod models;
pub mod processor;

pub use models::{ConsumedJob, NewOutboxEntry, OutboxEntry};
pub use processor::{BatchReport, OutboxProcessor, OutboxProcessorConfig};
