//! Entity state records, their transition log and idempotent initialization.

pub mod actions;
pub mod commands;
pub mod errors;
pub mod models;

pub use actions::{HandlerConfig, InitializeHandler, InitializeResult, InitializeSnapshot};
pub use commands::{InitializeCommand, JobSpec};
pub use errors::InitError;
pub use models::{FsmEvent, FsmState, IdempotencyRecord, InitiatedBy};
