//! Integration tests for the fallback detectors.
//!
//! - stalled entity scan (scheduled resubmission, `initiated_by = system`)
//! - worker guard (`initiated_by = worker`)
//! - consumer dedup ledger keyed on `outbox_id`

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::common::{fresh_command, init_command, unique, TestHarness};
use outbox_core::domains::fallback::{
    ensure_initialized, run_stalled_scan, EnsureOutcome, ScanReport, SqlStalledEntityFinder,
    StalledEntityFinder, StalledScanConfig,
};
use outbox_core::domains::fsm::{FsmEvent, FsmState, InitError, InitializeCommand, InitiatedBy};
use outbox_core::domains::outbox::ConsumedJob;
use test_context::test_context;
use uuid::Uuid;

/// Finder returning a fixed candidate list and recording the cutoff it was asked for.
struct StaticFinder {
    candidates: Vec<InitializeCommand>,
    cutoff: Mutex<Option<DateTime<Utc>>>,
}

impl StaticFinder {
    fn new(candidates: Vec<InitializeCommand>) -> Self {
        Self {
            candidates,
            cutoff: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StalledEntityFinder for StaticFinder {
    async fn find_stalled(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<InitializeCommand>> {
        *self.cutoff.lock().unwrap() = Some(cutoff);
        Ok(self.candidates.iter().take(limit as usize).cloned().collect())
    }
}

struct BrokenFinder;

#[async_trait]
impl StalledEntityFinder for BrokenFinder {
    async fn find_stalled(&self, _cutoff: DateTime<Utc>, _limit: i64) -> Result<Vec<InitializeCommand>> {
        anyhow::bail!("entity store unreachable")
    }
}

fn scan_config(pre_initialization_state: Option<&str>) -> StalledScanConfig {
    StalledScanConfig {
        pre_initialization_state: pre_initialization_state.map(String::from),
        ..Default::default()
    }
}

fn created_state_command() -> InitializeCommand {
    let mut command = fresh_command();
    command.initial_state = "created".to_string();
    command.jobs.clear();
    command
}

// =============================================================================
// Stalled entity scan
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn scan_resubmits_stalled_entities_and_skips_initialized_ones(ctx: &TestHarness) {
    let handler = ctx.handler();

    // Never initialized.
    let missing = fresh_command();

    // Registered in the pre-initialization state under another key.
    let registered = created_state_command();
    handler.handle(registered.clone()).await.unwrap();
    let pending = init_command(&registered.entity_id, &unique("key"));

    // Already initialized.
    let done = fresh_command();
    handler.handle(done.clone()).await.unwrap();

    let finder = StaticFinder::new(vec![missing.clone(), pending.clone(), done.clone()]);
    let report = run_stalled_scan(&handler, &finder, &scan_config(Some("created")))
        .await
        .unwrap();

    assert_eq!(
        report,
        ScanReport {
            submitted: 2,
            replayed: 0,
            skipped: 1,
            failed: 0,
        }
    );

    let events = FsmEvent::list_for_entity(&missing.entity_id, &ctx.db_pool).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].initiated_by, InitiatedBy::System);

    let state = FsmState::find_by_entity(&pending.entity_id, &ctx.db_pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.state, "outline");
    let events = FsmEvent::list_for_entity(&pending.entity_id, &ctx.db_pool).await.unwrap();
    assert_eq!(
        events.iter().map(|e| e.initiated_by).collect::<Vec<_>>(),
        vec![InitiatedBy::Api, InitiatedBy::System]
    );

    assert_eq!(FsmEvent::count_for_entity(&done.entity_id, &ctx.db_pool).await.unwrap(), 1);

    // The cutoff honours the grace period.
    let cutoff = finder.cutoff.lock().unwrap().unwrap();
    assert!(cutoff <= Utc::now() - chrono::Duration::seconds(299));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn scan_counts_used_keys_as_replays(ctx: &TestHarness) {
    let handler = ctx.handler();

    // Initialized into the pre-initialization state itself with the scan's key.
    let command = created_state_command();
    handler.handle(command.clone()).await.unwrap();

    let finder = StaticFinder::new(vec![command.clone()]);
    let report = run_stalled_scan(&handler, &finder, &scan_config(Some("created")))
        .await
        .unwrap();

    assert_eq!(report.replayed, 1);
    assert_eq!(report.submitted, 0);
    assert_eq!(FsmEvent::count_for_entity(&command.entity_id, &ctx.db_pool).await.unwrap(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn scan_without_pre_initialization_state_skips_any_existing_row(ctx: &TestHarness) {
    let handler = ctx.handler();
    let registered = created_state_command();
    handler.handle(registered.clone()).await.unwrap();

    let finder = StaticFinder::new(vec![init_command(&registered.entity_id, &unique("key"))]);
    let report = run_stalled_scan(&handler, &finder, &scan_config(None)).await.unwrap();

    assert_eq!(report.skipped, 1);
    let state = FsmState::find_by_entity(&registered.entity_id, &ctx.db_pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.state, "created");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn scan_continues_past_failing_candidates(ctx: &TestHarness) {
    let mut invalid = fresh_command();
    invalid.organization_id.clear();
    let valid = fresh_command();

    let finder = StaticFinder::new(vec![invalid, valid.clone()]);
    let report = run_stalled_scan(&ctx.handler(), &finder, &scan_config(None))
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(FsmState::count_for_entity(&valid.entity_id, &ctx.db_pool).await.unwrap(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn scan_fails_when_finder_fails(ctx: &TestHarness) {
    let err = run_stalled_scan(&ctx.handler(), &BrokenFinder, &scan_config(None))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("unreachable"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn sql_finder_returns_entities_older_than_cutoff(ctx: &TestHarness) {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS test_documents (
            entity_id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            organization_id TEXT NOT NULL,
            request_key TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(&ctx.db_pool)
    .await
    .unwrap();

    let organization_id = unique("org");
    let stale = unique("doc");
    let fresh = unique("doc");

    for (entity_id, age) in [(&stale, Duration::from_secs(3600)), (&fresh, Duration::ZERO)] {
        sqlx::query(
            r#"
            INSERT INTO test_documents (entity_id, owner_id, organization_id, request_key, created_at)
            VALUES ($1, 'u1', $2, $3, NOW() - make_interval(secs => $4))
            "#,
        )
        .bind(entity_id)
        .bind(&organization_id)
        .bind(format!("{}-init", entity_id))
        .bind(age.as_secs_f64())
        .execute(&ctx.db_pool)
        .await
        .unwrap();
    }

    let query = format!(
        r#"
        SELECT d.entity_id,
               d.owner_id AS user_id,
               d.organization_id,
               d.request_key AS idempotency_key,
               'outline' AS initial_state,
               jsonb_build_object('source', 'scan') AS data,
               jsonb_build_array(jsonb_build_object('queue', 'doc-proc', 'data', jsonb_build_object('docId', d.entity_id))) AS jobs
        FROM test_documents d
        LEFT JOIN fsm_states s ON s.entity_id = d.entity_id
        WHERE s.entity_id IS NULL
          AND d.organization_id = '{}'
          AND d.created_at < $1
        ORDER BY d.created_at
        LIMIT $2
        "#,
        organization_id
    );
    let finder = SqlStalledEntityFinder::new(ctx.db_pool.clone(), query);

    let commands = finder
        .find_stalled(Utc::now() - chrono::Duration::minutes(5), 10)
        .await
        .unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].entity_id, stale);
    assert_eq!(commands[0].idempotency_key, format!("{}-init", stale));
    assert_eq!(commands[0].initiated_by, InitiatedBy::System);
    assert_eq!(commands[0].jobs[0].queue, "doc-proc");

    let report = run_stalled_scan(&ctx.handler(), &finder, &scan_config(None)).await.unwrap();
    assert_eq!(report.submitted, 1);

    // Initialized entities drop out of the query.
    let report = run_stalled_scan(&ctx.handler(), &finder, &scan_config(None)).await.unwrap();
    assert_eq!(report, ScanReport::default());
}

// =============================================================================
// Worker guard
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn guard_initializes_missing_entity_as_worker(ctx: &TestHarness) {
    let command = fresh_command();
    let entity_id = command.entity_id.clone();

    let outcome = ensure_initialized(&ctx.handler(), &entity_id, None, || command)
        .await
        .unwrap();

    let result = match outcome {
        EnsureOutcome::Initialized(result) => result,
        other => panic!("expected initialization, got {:?}", other),
    };
    assert!(!result.from_cache);

    let events = FsmEvent::list_for_entity(&entity_id, &ctx.db_pool).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].initiated_by, InitiatedBy::Worker);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn guard_leaves_initialized_entity_alone(ctx: &TestHarness) {
    let command = fresh_command();
    let entity_id = command.entity_id.clone();
    ctx.handler().handle(command).await.unwrap();

    let built = AtomicBool::new(false);
    let outcome = ensure_initialized(&ctx.handler(), &entity_id, Some("created"), || {
        built.store(true, Ordering::SeqCst);
        fresh_command()
    })
    .await
    .unwrap();

    assert!(matches!(outcome, EnsureOutcome::AlreadyInitialized(ref s) if s.state == "outline"));
    assert!(!built.load(Ordering::SeqCst));
    assert_eq!(FsmEvent::count_for_entity(&entity_id, &ctx.db_pool).await.unwrap(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn guard_initializes_entity_still_in_pre_initialization_state(ctx: &TestHarness) {
    let registered = created_state_command();
    ctx.handler().handle(registered.clone()).await.unwrap();

    let command = init_command(&registered.entity_id, &unique("key"));
    let outcome = ensure_initialized(&ctx.handler(), &registered.entity_id, Some("created"), || command)
        .await
        .unwrap();

    match outcome {
        EnsureOutcome::Initialized(result) => assert_eq!(result.fsm_state.state, "outline"),
        other => panic!("expected initialization, got {:?}", other),
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn guard_rejects_command_for_another_entity(ctx: &TestHarness) {
    let entity_id = unique("entity");

    let err = ensure_initialized(&ctx.handler(), &entity_id, None, fresh_command)
        .await
        .unwrap_err();

    assert!(matches!(err, InitError::Validation(_)));
    assert_eq!(FsmState::count_for_entity(&entity_id, &ctx.db_pool).await.unwrap(), 0);
}

// =============================================================================
// Consumer dedup ledger
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn consumed_job_claims_once_per_consumer(ctx: &TestHarness) {
    let outbox_id = Uuid::now_v7();

    assert!(ConsumedJob::try_claim(outbox_id, "doc-proc", &ctx.db_pool).await.unwrap());
    assert!(!ConsumedJob::try_claim(outbox_id, "doc-proc", &ctx.db_pool).await.unwrap());
    assert!(ConsumedJob::try_claim(outbox_id, "audit", &ctx.db_pool).await.unwrap());

    let record = ConsumedJob::find(outbox_id, "doc-proc", &ctx.db_pool)
        .await
        .unwrap()
        .expect("claim should be recorded");
    assert_eq!(record.outbox_id, outbox_id);
    assert!(ConsumedJob::find(Uuid::now_v7(), "doc-proc", &ctx.db_pool)
        .await
        .unwrap()
        .is_none());
}
