pub mod consumed_job;
pub mod outbox_entry;

pub use consumed_job::ConsumedJob;
pub use outbox_entry::{NewOutboxEntry, OutboxEntry};
