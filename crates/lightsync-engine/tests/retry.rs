//! Transient failure handling

mod common;

use common::*;
use lightsync_engine::{
    BlockCache, CycleOutcome, Error, FailureKind, RecordingScanner, ServiceError, SimulatedChain,
    SyncEvent, SyncState,
};
use lightsync_storage::{MemoryProgressStore, SqliteBlockCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn failure_kind(outcome: CycleOutcome) -> FailureKind {
    match outcome {
        CycleOutcome::Failed(failure) => failure.kind,
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_back_off_then_succeed() {
    let h = harness(1099, config(1000));
    h.chain.fail_tip_queries(2, ServiceError::Timeout);

    let started = Instant::now();
    assert_eq!(h.engine.sync_once(true).await, synced(1099));

    // 1s then 2s of backoff
    assert!(started.elapsed() >= Duration::from_secs(3));
    // Two failures, the successful query and the closing tip check
    assert_eq!(h.chain.tip_queries(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let mut config = config(1000);
    config.retries = 2;
    let h = harness(1099, config);
    h.chain.fail_tip_queries(100, ServiceError::Timeout);
    let mut events = h.engine.subscribe();

    let kind = failure_kind(h.engine.sync_once(true).await);
    assert_eq!(kind, FailureKind::RetriesExhausted);
    assert_eq!(h.chain.tip_queries(), 3);
    assert!(matches!(h.engine.state(), SyncState::Error(_)));
    assert!(matches!(
        drain(&mut events).last(),
        Some(SyncEvent::Failed(f)) if f.kind == FailureKind::RetriesExhausted
    ));
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_when_disabled() {
    let h = harness(1099, config(1000));
    h.chain.fail_tip_queries(1, ServiceError::Timeout);

    assert_eq!(
        failure_kind(h.engine.sync_once(false).await),
        FailureKind::Transient
    );
    assert_eq!(h.chain.tip_queries(), 1);

    // Next cycle succeeds
    assert_eq!(h.engine.sync_once(false).await, synced(1099));
}

#[tokio::test(start_paused = true)]
async fn test_stream_failure_resumes_without_refetching() {
    let h = harness(1099, config(1000));
    h.chain.fail_stream_at(1050, ServiceError::Timeout);

    assert_eq!(h.engine.sync_once(true).await, synced(1099));
    assert_eq!(h.chain.fetched_heights(), (1000..=1099).collect::<Vec<_>>());
    assert_eq!(h.chain.stream_opens(), 2);
}

#[tokio::test]
async fn test_scanner_failure_is_not_retried() {
    let cache: Arc<dyn BlockCache> = Arc::new(SqliteBlockCache::open_in_memory().unwrap());
    let scanner = RecordingScanner::new();
    scanner.fail_next_scan(Error::Scanner("wallet database locked".into()));
    let h = harness_with(
        SimulatedChain::new(1099),
        cache,
        Box::new(MemoryProgressStore::new()),
        scanner,
        config(1000),
    );

    assert_eq!(
        failure_kind(h.engine.sync_once(true).await),
        FailureKind::Protocol
    );
    let progress = h.engine.progress().unwrap();
    assert_eq!(progress.scanned, 0);
    assert!(progress.downloaded >= 1019);

    assert_eq!(h.engine.sync_once(true).await, synced(1099));
}
