//! Long-running background services with cooperative shutdown.
//!
//! ```ignore
//! ServiceHost::new()
//!     .with_service(OutboxProcessor::new(pool, dispatcher, config))
//!     .run_until_shutdown()
//!     .await?;
//! ```

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A service that runs until its shutdown token is cancelled.
#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Runs a set of services and stops them together.
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service<S: Service>(mut self, service: S) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Token that stops every hosted service when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all services until one of them exits or the token is cancelled.
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();

        for service in self.services {
            let name = service.name();
            let token = self.shutdown.child_token();
            info!(service = name, "starting service");
            tasks.spawn(async move { (name, service.run(token).await) });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            // Any service exiting brings the rest down with it.
            self.shutdown.cancel();

            match joined {
                Ok((name, Ok(()))) => info!(service = name, "service stopped"),
                Ok((name, Err(e))) => {
                    error!(service = name, error = %e, "service failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "service task panicked");
                    first_error.get_or_insert(e.into());
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run until ctrl-c, then shut every service down.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                token.cancel();
            }
        });

        self.run().await
    }
}
