//! Full sync cycles against a simulated chain

mod common;

use common::*;
use lightsync_engine::{
    BlockCache, BlockRange, CycleOutcome, RecordingScanner, SimulatedChain, SyncEvent, SyncPhase,
    SyncProgress, SyncState,
};
use lightsync_storage::{FsBlockCache, MemoryProgressStore, SqliteBlockCache, SqliteProgressStore};
use std::sync::Arc;
use std::time::Duration;

fn at(height: u64) -> SyncProgress {
    SyncProgress {
        downloaded: height,
        scanned: height,
        enhanced: height,
        utxo_fetched: height,
    }
}

#[tokio::test]
async fn test_fresh_wallet_syncs_in_batches() {
    let h = harness(1099, config(1000));
    let mut events = h.engine.subscribe();

    assert_eq!(h.engine.sync_once(true).await, synced(1099));
    assert_eq!(h.engine.progress().unwrap(), at(1099));
    assert_eq!(h.engine.state(), SyncState::Synced);

    let batches: Vec<_> = BlockRange::new(1000, 1099).batches(20).collect();
    assert_eq!(batches.len(), 5);
    assert_eq!(h.scanner.scanned_ranges(), batches);
    assert_eq!(h.scanner.enhanced_ranges(), vec![BlockRange::new(1000, 1099)]);
    assert_eq!(h.scanner.utxo_ranges(), vec![BlockRange::new(1000, 1099)]);

    assert_eq!(h.chain.fetched_heights(), (1000..=1099).collect::<Vec<_>>());
    assert_eq!(h.chain.stream_opens(), 1);
    assert_eq!(h.cache.earliest_height().unwrap(), Some(1000));
    assert_eq!(h.cache.latest_height().unwrap(), Some(1099));

    let events = drain(&mut events);
    assert_eq!(
        events.first(),
        Some(&SyncEvent::PhaseStarted {
            phase: SyncPhase::Download,
            range: BlockRange::new(1000, 1099),
        })
    );
    assert_eq!(
        events.last(),
        Some(&SyncEvent::Idle {
            latest_height: 1099,
            scanned_height: 1099,
        })
    );

    let scan_progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::PhaseProgress {
                phase: SyncPhase::Scan,
                height,
                fraction,
                ..
            } => Some((*height, *fraction)),
            _ => None,
        })
        .collect();
    assert_eq!(scan_progress.len(), 5);
    assert_eq!(scan_progress[0], (1019, 0.2));
    assert_eq!(scan_progress[4], (1099, 1.0));
}

#[tokio::test]
async fn test_resumes_from_persisted_cursors() {
    let chain = SimulatedChain::new(1099);
    let cache: Arc<dyn BlockCache> = Arc::new(SqliteBlockCache::open_in_memory().unwrap());
    let store = MemoryProgressStore::new();
    seed(&chain, cache.as_ref(), &store, 1000, [1049, 1039, 1039, 1039]);

    let h = harness_with(chain, cache, Box::new(store), RecordingScanner::new(), config(1000));
    assert_eq!(h.engine.sync_once(true).await, synced(1099));

    // Nothing below the downloaded cursor is fetched again
    assert_eq!(h.chain.fetched_heights(), (1050..=1099).collect::<Vec<_>>());
    assert_eq!(
        h.scanner.scanned_ranges(),
        vec![
            BlockRange::new(1040, 1059),
            BlockRange::new(1060, 1079),
            BlockRange::new(1080, 1099),
        ]
    );
    assert_eq!(h.engine.progress().unwrap(), at(1099));
}

#[tokio::test]
async fn test_only_lagging_phase_runs() {
    let chain = SimulatedChain::new(1099);
    let cache: Arc<dyn BlockCache> = Arc::new(SqliteBlockCache::open_in_memory().unwrap());
    let store = MemoryProgressStore::new();
    seed(&chain, cache.as_ref(), &store, 1000, [1099, 1099, 1050, 1099]);

    let h = harness_with(chain, cache, Box::new(store), RecordingScanner::new(), config(1000));
    assert_eq!(h.engine.sync_once(true).await, synced(1099));

    assert_eq!(h.chain.stream_opens(), 0);
    assert!(h.scanner.scanned_ranges().is_empty());
    assert!(h.scanner.utxo_ranges().is_empty());
    assert_eq!(h.scanner.enhanced_ranges(), vec![BlockRange::new(1051, 1099)]);
    assert_eq!(h.engine.progress().unwrap(), at(1099));
}

#[tokio::test]
async fn test_stale_remote_waits() {
    let chain = SimulatedChain::new(1100);
    let cache: Arc<dyn BlockCache> = Arc::new(SqliteBlockCache::open_in_memory().unwrap());
    let store = MemoryProgressStore::new();
    seed(&chain, cache.as_ref(), &store, 1000, [1100, 1100, 1100, 1100]);
    chain.set_tip(1099);

    let h = harness_with(chain, cache, Box::new(store), RecordingScanner::new(), config(1000));
    let mut events = h.engine.subscribe();

    assert_eq!(
        h.engine.sync_once(true).await,
        CycleOutcome::Waiting {
            latest_height: 1099,
            downloaded: 1100,
        }
    );
    assert_eq!(h.engine.progress().unwrap(), at(1100));
    assert_eq!(h.chain.stream_opens(), 0);
    assert_eq!(
        drain(&mut events),
        vec![SyncEvent::Idle {
            latest_height: 1099,
            scanned_height: 1100,
        }]
    );
}

#[tokio::test]
async fn test_caught_up_cycle_fetches_nothing() {
    let h = harness(1099, config(1000));
    assert_eq!(h.engine.sync_once(true).await, synced(1099));
    let opens = h.chain.stream_opens();

    assert_eq!(h.engine.sync_once(true).await, synced(1099));
    assert_eq!(h.chain.stream_opens(), opens);
    assert_eq!(h.scanner.scanned_ranges().len(), 5);
}

#[tokio::test]
async fn test_partial_scanner_progress() {
    let cache: Arc<dyn BlockCache> = Arc::new(SqliteBlockCache::open_in_memory().unwrap());
    let h = harness_with(
        SimulatedChain::new(1039),
        cache,
        Box::new(MemoryProgressStore::new()),
        RecordingScanner::new().with_max_blocks_per_call(7),
        config(1000),
    );

    assert_eq!(h.engine.sync_once(true).await, synced(1039));
    let ranges = h.scanner.scanned_ranges();
    assert_eq!(ranges[0], BlockRange::new(1000, 1006));
    assert_eq!(ranges[2], BlockRange::new(1014, 1019));
    assert_eq!(ranges[3], BlockRange::new(1020, 1026));
    assert_eq!(ranges.iter().map(|r| r.len()).sum::<u64>(), 40);
}

#[tokio::test]
async fn test_scanned_blocks_are_pruned() {
    let mut config = config(1000);
    config.retained_scanned_blocks = Some(10);
    let h = harness(1099, config);

    assert_eq!(h.engine.sync_once(true).await, synced(1099));
    assert_eq!(h.cache.earliest_height().unwrap(), Some(1090));
    assert_eq!(h.cache.latest_height().unwrap(), Some(1099));

    // The retained tail still anchors validation of new blocks
    h.chain.advance_tip(30);
    assert_eq!(h.engine.sync_once(true).await, synced(1129));
    assert_eq!(h.cache.earliest_height().unwrap(), Some(1120));
}

#[tokio::test]
async fn test_lost_cache_is_downloaded_again() {
    let h = harness(1099, config(1000));
    assert_eq!(h.engine.sync_once(true).await, synced(1099));

    h.cache.clear().unwrap();
    h.chain.advance_tip(10);
    h.chain.clear_fetched();

    assert_eq!(h.engine.sync_once(true).await, synced(1109));
    assert_eq!(h.chain.fetched_heights(), (1100..=1109).collect::<Vec<_>>());
    assert_eq!(h.engine.progress().unwrap(), at(1109));
}

#[tokio::test]
async fn test_filesystem_cache_backend() {
    let dir = tempfile::tempdir().unwrap();
    let cache: Arc<dyn BlockCache> = Arc::new(FsBlockCache::open(dir.path()).unwrap());
    let h = harness_with(
        SimulatedChain::new(1099),
        cache,
        Box::new(MemoryProgressStore::new()),
        RecordingScanner::new(),
        config(1000),
    );

    assert_eq!(h.engine.sync_once(true).await, synced(1099));
    assert_eq!(h.engine.progress().unwrap(), at(1099));

    let files = std::fs::read_dir(dir.path().join("blocks")).unwrap().count();
    assert_eq!(files, 100);
}

#[tokio::test]
async fn test_progress_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let chain = SimulatedChain::new(1049);

    let open = |chain: &SimulatedChain| {
        let cache: Arc<dyn BlockCache> =
            Arc::new(SqliteBlockCache::open(dir.path().join("cache.sqlite")).unwrap());
        let store = SqliteProgressStore::open(dir.path().join("progress.sqlite"), "main").unwrap();
        harness_with(
            chain.clone(),
            cache,
            Box::new(store),
            RecordingScanner::new(),
            config(1000),
        )
    };

    let first = open(&chain);
    assert_eq!(first.engine.sync_once(true).await, synced(1049));
    drop(first);

    chain.advance_tip(50);
    chain.clear_fetched();
    let second = open(&chain);
    assert_eq!(second.engine.sync_once(true).await, synced(1099));
    assert_eq!(chain.fetched_heights(), (1050..=1099).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_tip_moving_mid_cycle_triggers_another_cycle() {
    let cache: Arc<dyn BlockCache> = Arc::new(SqliteBlockCache::open_in_memory().unwrap());
    let h = harness_with(
        SimulatedChain::new(1099),
        cache,
        Box::new(MemoryProgressStore::new()),
        RecordingScanner::new().with_scan_delay(Duration::from_secs(1)),
        config(1000),
    );
    let mut events = h.engine.subscribe();

    let chain = h.chain.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        chain.advance_tip(5);
    });

    // The poll interval is an hour; only an immediate re-run gets here in time
    h.engine.start(true).await;
    wait_for(&mut events, is_idle_at(1104)).await;
    h.engine.stop().await;

    assert_eq!(h.engine.progress().unwrap(), at(1104));
}
