// Outbox Core - transactional outbox and idempotent state initialization
//
// An entity's state record, its first transition event and its outbound jobs
// are committed in one transaction, exactly once per idempotency key. A
// background processor drains the outbox into the job queue.

pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
