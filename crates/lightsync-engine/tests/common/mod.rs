//! Shared fixtures for engine tests

#![allow(dead_code)]

use lightsync_engine::{
    BlockCache, BlockHeight, BlockRange, CycleOutcome, ProgressKey, RecordingScanner,
    SimulatedChain, SyncConfig, SyncDependencies, SyncEngine, SyncEvent,
};
use lightsync_storage::{MemoryProgressStore, ProgressStore, SqliteBlockCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct Harness {
    pub chain: SimulatedChain,
    pub cache: Arc<dyn BlockCache>,
    pub scanner: Arc<RecordingScanner>,
    pub engine: Arc<SyncEngine>,
}

pub fn config(birthday: BlockHeight) -> SyncConfig {
    SyncConfig {
        birthday,
        batch_size: 20,
        poll_interval: Duration::from_secs(3600),
        poll_jitter: false,
        ..SyncConfig::default()
    }
}

pub fn harness(tip: BlockHeight, config: SyncConfig) -> Harness {
    let cache: Arc<dyn BlockCache> = Arc::new(SqliteBlockCache::open_in_memory().unwrap());
    harness_with(
        SimulatedChain::new(tip),
        cache,
        Box::new(MemoryProgressStore::new()),
        RecordingScanner::new(),
        config,
    )
}

pub fn harness_with(
    chain: SimulatedChain,
    cache: Arc<dyn BlockCache>,
    progress: Box<dyn ProgressStore>,
    scanner: RecordingScanner,
    config: SyncConfig,
) -> Harness {
    let scanner = Arc::new(scanner.with_cache(cache.clone()));
    let engine = SyncEngine::new(
        SyncDependencies {
            source: Arc::new(chain.clone()),
            cache: cache.clone(),
            progress,
            scanner: scanner.clone(),
            enhancer: Some(scanner.clone()),
            utxo_fetcher: Some(scanner.clone()),
        },
        config,
    )
    .unwrap();

    Harness {
        chain,
        cache,
        scanner,
        engine: Arc::new(engine),
    }
}

/// Store every cursor and fill the cache with the chain's blocks up to
/// `downloaded`
pub fn seed(
    chain: &SimulatedChain,
    cache: &dyn BlockCache,
    store: &dyn ProgressStore,
    from: BlockHeight,
    cursors: [BlockHeight; 4],
) {
    if cursors[0] >= from {
        cache.append(&chain.blocks(BlockRange::new(from, cursors[0]))).unwrap();
    }
    store
        .store_all(&[
            (ProgressKey::Downloaded, cursors[0]),
            (ProgressKey::Scanned, cursors[1]),
            (ProgressKey::Enhanced, cursors[2]),
            (ProgressKey::UtxoFetched, cursors[3]),
        ])
        .unwrap();
}

pub fn synced(latest_height: BlockHeight) -> CycleOutcome {
    CycleOutcome::Synced {
        latest_height,
        scanned_height: latest_height,
        tip_moved: false,
    }
}

/// Events already delivered
pub fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Next event matching `pred`, failing after ten minutes
pub async fn wait_for(
    events: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn is_idle_at(scanned: BlockHeight) -> impl Fn(&SyncEvent) -> bool {
    move |event| {
        matches!(event, SyncEvent::Idle { scanned_height, .. } if *scanned_height == scanned)
    }
}
