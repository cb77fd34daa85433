use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::fallback::StalledScanConfig;
use crate::domains::fsm::HandlerConfig;
use crate::domains::outbox::OutboxProcessorConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub nats_url: String,
    pub cache_capacity: u64,
    pub handler: HandlerConfig,
    pub outbox: OutboxProcessorConfig,
    pub stalled_scan: StalledScanConfig,
    /// SQL returning stalled entities (`$1` = cutoff, `$2` = limit).
    /// Layer 2 scanning is disabled when unset.
    pub stalled_entity_query: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let handler_defaults = HandlerConfig::default();
        let outbox_defaults = OutboxProcessorConfig::default();
        let scan_defaults = StalledScanConfig::default();

        let record_ttl = match env::var("IDEMPOTENCY_RECORD_TTL_SECS") {
            Ok(raw) => Some(Duration::from_secs(
                raw.parse()
                    .context("IDEMPOTENCY_RECORD_TTL_SECS must be a valid number")?,
            )),
            Err(_) => None,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
            nats_url: env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            cache_capacity: parse_or("IDEMPOTENCY_CACHE_CAPACITY", 10_000)?,
            handler: HandlerConfig {
                cache_ttl: secs_or("IDEMPOTENCY_CACHE_TTL_SECS", handler_defaults.cache_ttl)?,
                cache_timeout: millis_or(
                    "IDEMPOTENCY_CACHE_TIMEOUT_MS",
                    handler_defaults.cache_timeout,
                )?,
                transaction_timeout: millis_or(
                    "INIT_TRANSACTION_TIMEOUT_MS",
                    handler_defaults.transaction_timeout,
                )?,
                record_ttl,
            },
            outbox: OutboxProcessorConfig {
                batch_size: parse_or("OUTBOX_BATCH_SIZE", outbox_defaults.batch_size)?,
                poll_interval: millis_or("OUTBOX_POLL_INTERVAL_MS", outbox_defaults.poll_interval)?,
                dispatch_timeout: millis_or(
                    "OUTBOX_DISPATCH_TIMEOUT_MS",
                    outbox_defaults.dispatch_timeout,
                )?,
                claim_lease: millis_or("OUTBOX_CLAIM_LEASE_MS", outbox_defaults.claim_lease)?,
            },
            stalled_scan: StalledScanConfig {
                grace_period: secs_or("STALLED_GRACE_PERIOD_SECS", scan_defaults.grace_period)?,
                limit: parse_or("STALLED_SCAN_LIMIT", scan_defaults.limit)?,
                pre_initialization_state: env::var("PRE_INITIALIZATION_STATE").ok(),
            },
            stalled_entity_query: env::var("STALLED_ENTITY_QUERY").ok(),
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}

fn millis_or(key: &str, default: Duration) -> Result<Duration> {
    parse_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    parse_or(key, default.as_secs()).map(Duration::from_secs)
}
