//! Server dependencies shared by the handler, the processor and scheduled tasks.
//!
//! External collaborators sit behind traits so tests can swap in
//! [`TestJobDispatcher`](crate::kernel::TestJobDispatcher) and
//! [`NoopCache`](crate::kernel::NoopCache).

use std::sync::Arc;

use sqlx::PgPool;

use crate::domains::fsm::{HandlerConfig, InitializeHandler};
use crate::domains::outbox::{OutboxProcessor, OutboxProcessorConfig};
use crate::kernel::{IdempotencyCache, JobDispatcher};

#[derive(Clone)]
pub struct ServerDeps {
    pub db_pool: PgPool,
    pub cache: Arc<dyn IdempotencyCache>,
    pub dispatcher: Arc<dyn JobDispatcher>,
}

impl ServerDeps {
    pub fn new(
        db_pool: PgPool,
        cache: Arc<dyn IdempotencyCache>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            db_pool,
            cache,
            dispatcher,
        }
    }

    pub fn initialize_handler(&self, config: HandlerConfig) -> InitializeHandler {
        InitializeHandler::new(self.db_pool.clone(), self.cache.clone(), config)
    }

    pub fn outbox_processor(&self, config: OutboxProcessorConfig) -> OutboxProcessor {
        OutboxProcessor::new(self.db_pool.clone(), self.dispatcher.clone(), config)
    }
}
