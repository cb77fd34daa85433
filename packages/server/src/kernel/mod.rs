//! Kernel module - infrastructure shared by the domains.

pub mod cache;
pub mod deps;
pub mod job_queue;
pub mod scheduled_tasks;
pub mod service_host;

pub use cache::{idempotency_cache_key, CacheError, IdempotencyCache, MokaCache, NoopCache};
pub use deps::ServerDeps;
pub use job_queue::{subject_for, DispatchedJob, JobDispatcher, NatsJobDispatcher, TestJobDispatcher};
pub use scheduled_tasks::{start_scheduler, StalledScanTask};
pub use service_host::{Service, ServiceHost};
