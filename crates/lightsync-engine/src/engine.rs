//! Sync state machine.
//!
//! Each cycle queries the remote tip, asks the progress tracker for the
//! next unit of work and runs the phases in order: download, validate,
//! scan, enhance, fetch UTXOs. Every phase persists its own cursor, so an
//! interrupted cycle resumes where it stopped.
//!
//! Reorgs found by validation rewind cache and cursors and restart the
//! cycle. Transient failures are retried with capped exponential backoff;
//! anything else fails the cycle and the next poll starts a fresh one.
//! Rewind, wipe and resync requests run only while no cycle holds the
//! engine; requests arriving mid-cycle are deferred to its end.

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::downloader::BlockDownloader;
use crate::events::{progress_fraction, SyncEvent, SyncFailure, SyncPhase, SyncState};
use crate::hooks::{DeferredActionQueue, DeferredHook};
use crate::metrics::PerfCounters;
use crate::progress::{NextState, SyncProgress, SyncProgressTracker, SyncRanges};
use crate::retry::{jittered, Backoff};
use crate::source::BlockSource;
use crate::validator::validate_chain;
use crate::wallet::{NoteScanner, TransactionEnhancer, UtxoFetcher};
use crate::{Error, Result};
use lightsync_storage::{BlockCache, BlockHeight, BlockRange, ProgressKey, ProgressStore};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Collaborators the engine drives
pub struct SyncDependencies {
    /// Remote block supplier
    pub source: Arc<dyn BlockSource>,
    /// Local block cache
    pub cache: Arc<dyn BlockCache>,
    /// Cursor persistence
    pub progress: Box<dyn ProgressStore>,
    /// Note scanner
    pub scanner: Arc<dyn NoteScanner>,
    /// Transaction enhancer; without one the enhance cursor just follows the scan
    pub enhancer: Option<Arc<dyn TransactionEnhancer>>,
    /// UTXO fetcher; without one the UTXO cursor just follows the scan
    pub utxo_fetcher: Option<Arc<dyn UtxoFetcher>>,
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every phase caught up with `latest_height`
    Synced {
        /// Remote tip the cycle worked towards
        latest_height: BlockHeight,
        /// Scanned cursor after the cycle
        scanned_height: BlockHeight,
        /// The remote tip advanced while the cycle ran
        tip_moved: bool,
    },
    /// Local state is ahead of the remote
    Waiting {
        /// Remote tip
        latest_height: BlockHeight,
        /// Local downloaded cursor
        downloaded: BlockHeight,
    },
    /// The cycle failed
    Failed(SyncFailure),
    /// The cycle was cancelled
    Cancelled,
}

struct EngineInner {
    config: SyncConfig,
    source: Arc<dyn BlockSource>,
    cache: Arc<dyn BlockCache>,
    scanner: Arc<dyn NoteScanner>,
    enhancer: Option<Arc<dyn TransactionEnhancer>>,
    utxo_fetcher: Option<Arc<dyn UtxoFetcher>>,
    tracker: Arc<SyncProgressTracker>,
    downloader: BlockDownloader,
    perf: Arc<PerfCounters>,
    events: broadcast::Sender<SyncEvent>,
    state: watch::Sender<SyncState>,
    hooks: parking_lot::Mutex<DeferredActionQueue>,
    exclusive: tokio::sync::Mutex<()>,
    wake: Notify,
}

/// Wallet sync engine
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    cancel: parking_lot::Mutex<CancelToken>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Assemble an engine; nothing runs until [`Self::start`] or [`Self::sync_once`]
    pub fn new(deps: SyncDependencies, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        deps.cache.initialize()?;

        let tracker = Arc::new(SyncProgressTracker::new(deps.progress));
        let perf = Arc::new(PerfCounters::new());
        let downloader = BlockDownloader::new(
            deps.source.clone(),
            deps.cache.clone(),
            tracker.clone(),
            perf.clone(),
            config.stream_batch_multiplier,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(SyncState::Unprepared);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                source: deps.source,
                cache: deps.cache,
                scanner: deps.scanner,
                enhancer: deps.enhancer,
                utxo_fetcher: deps.utxo_fetcher,
                tracker,
                downloader,
                perf,
                events,
                state,
                hooks: parking_lot::Mutex::new(DeferredActionQueue::new()),
                exclusive: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
            }),
            cancel: parking_lot::Mutex::new(CancelToken::new()),
            task: tokio::sync::Mutex::new(None),
        })
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Current state
    pub fn state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    /// Persisted cursors
    pub fn progress(&self) -> Result<SyncProgress> {
        self.inner.tracker.snapshot()
    }

    /// Performance counters
    pub fn perf(&self) -> Arc<PerfCounters> {
        self.inner.perf.clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    fn active_token(&self) -> CancelToken {
        let mut token = self.cancel.lock();
        if token.is_cancelled() {
            *token = CancelToken::new();
        }
        token.clone()
    }

    /// Run cycles in the background until [`Self::stop`]. With `retry` off,
    /// transient failures end the cycle at once instead of backing off.
    pub async fn start(&self, retry: bool) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Sync already running");
            return;
        }

        let cancel = self.active_token();
        info!(event = "sync_started", retry, "Starting sync");
        *task = Some(tokio::spawn(self.inner.clone().run_loop(cancel, retry)));
    }

    /// Cancel the running cycle and wait for the background loop to exit
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Sync task ended abnormally: {}", e);
            }
        }
    }

    /// Run a single cycle in the caller's task
    pub async fn sync_once(&self, retry: bool) -> CycleOutcome {
        let cancel = self.active_token();
        self.inner.run_cycle_exclusive(&cancel, retry).await
    }

    /// Ask for another cycle as soon as the engine is free
    pub async fn request_sync(&self) {
        self.inner.submit(DeferredHook::AnotherSync).await;
    }

    /// Rewind cache, cursors and scanner to `height` (the scanned cursor
    /// when `None`), never below the birthday. Deferred while a cycle runs.
    /// Resolves to the height rewound to.
    pub async fn rewind(&self, height: Option<BlockHeight>) -> Result<BlockHeight> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .submit(DeferredHook::Rewind {
                height,
                on_complete: tx,
            })
            .await;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Drop all cached blocks, cursors and scanner state. Deferred while a
    /// cycle runs.
    pub async fn wipe(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .submit(DeferredHook::Wipe { on_complete: tx })
            .await;
        rx.await.map_err(|_| Error::Cancelled)?
    }
}

impl EngineInner {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn progress_event(&self, phase: SyncPhase, range: BlockRange, height: BlockHeight) {
        self.emit(SyncEvent::PhaseProgress {
            phase,
            range,
            height,
            fraction: progress_fraction(&range, height),
        });
    }

    async fn run_loop(self: Arc<Self>, cancel: CancelToken, retry: bool) {
        loop {
            let outcome = self.run_cycle_exclusive(&cancel, retry).await;
            if outcome == CycleOutcome::Cancelled || cancel.is_cancelled() {
                break;
            }

            if matches!(outcome, CycleOutcome::Synced { tip_moved: true, .. }) {
                debug!("Remote tip moved during the cycle, syncing again");
                continue;
            }

            let wait = if self.config.poll_jitter {
                jittered(self.config.poll_interval)
            } else {
                self.config.poll_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {
                    debug!("Sync requested");
                }
                _ = cancel.cancelled() => break,
            }
        }

        self.downloader.stop().await;
        self.set_state(SyncState::Stopped);
        self.emit(SyncEvent::Stopped);
        info!(event = "sync_stopped", "Sync stopped");

        self.drain_hooks_if_idle().await;
    }

    async fn run_cycle_exclusive(&self, cancel: &CancelToken, retry: bool) -> CycleOutcome {
        let guard = self.exclusive.lock().await;
        let outcome = self.run_cycle_with_retries(cancel, retry).await;
        self.run_hooks().await;
        drop(guard);

        self.drain_hooks_if_idle().await;
        outcome
    }

    async fn submit(&self, hook: DeferredHook) {
        let kind = hook.kind();
        let (replaced, pending) = {
            let mut hooks = self.hooks.lock();
            let replaced = hooks.insert(hook);
            (replaced, hooks.len())
        };
        if let Some(replaced) = replaced {
            debug!(?kind, "Replacing pending request");
            replaced.supersede();
        }
        debug!(?kind, pending, "Queued request");
        self.drain_hooks_if_idle().await;
    }

    /// Run pending hooks unless a cycle holds the engine; that cycle will
    /// run them when it ends.
    async fn drain_hooks_if_idle(&self) {
        loop {
            let Ok(guard) = self.exclusive.try_lock() else {
                return;
            };
            self.run_hooks().await;
            drop(guard);

            if self.hooks.lock().is_empty() {
                return;
            }
        }
    }

    async fn run_hooks(&self) {
        let hooks = self.hooks.lock().drain();
        for hook in hooks {
            match hook {
                DeferredHook::Wipe { on_complete } => {
                    let _ = on_complete.send(self.wipe().await);
                }
                DeferredHook::Rewind {
                    height,
                    on_complete,
                } => {
                    let _ = on_complete.send(self.rewind(height).await);
                }
                DeferredHook::AnotherSync => self.wake.notify_one(),
            }
        }
    }

    async fn run_cycle_with_retries(&self, cancel: &CancelToken, retry: bool) -> CycleOutcome {
        let mut backoff =
            Backoff::new(self.config.initial_backoff, self.config.max_backoff_interval);
        let mut reorgs = 0u32;

        loop {
            let error = match self.run_cycle(cancel).await {
                Ok(outcome) => return outcome,
                Err(Error::Cancelled) => {
                    debug!("Sync cycle cancelled");
                    return CycleOutcome::Cancelled;
                }
                Err(Error::InvalidChain { height }) => {
                    match self.handle_reorg(height, reorgs).await {
                        Ok(()) => {
                            reorgs += 1;
                            continue;
                        }
                        Err(Error::Cancelled) => return CycleOutcome::Cancelled,
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if error.is_storage() {
                error!(error = %error, "Local sync state unreadable or unwritable, not retrying");
                return self.fail(&error);
            }
            if !(retry && error.is_transient()) {
                return self.fail(&error);
            }

            if backoff.attempts() >= self.config.retries {
                return self.fail(&Error::MaxAttemptsReached {
                    attempts: backoff.attempts() + 1,
                    last: error.to_string(),
                });
            }

            let delay = backoff.next_delay();
            warn!(
                event = "sync_retry",
                attempt = backoff.attempts(),
                max_attempts = self.config.retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Sync cycle failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return CycleOutcome::Cancelled,
            }
        }
    }

    fn fail(&self, error: &Error) -> CycleOutcome {
        let failure = SyncFailure::from(error);
        error!(
            event = "sync_failed",
            kind = ?failure.kind,
            error = %error,
            "Sync cycle failed"
        );
        self.set_state(SyncState::Error(failure.clone()));
        self.emit(SyncEvent::Failed(failure.clone()));
        CycleOutcome::Failed(failure)
    }

    async fn run_cycle(&self, cancel: &CancelToken) -> Result<CycleOutcome> {
        cancel.check()?;

        let tip = cancel
            .run(async { self.source.latest_height().await.map_err(Error::from) })
            .await?;

        let latest_cached = cancel.run(self.scanner.latest_cached_height()).await?;
        self.tracker.migrate_if_needed(latest_cached)?;
        self.repair_downloaded_cursor()?;

        let scanned = self.tracker.scanned()?;
        let birthday = self.config.birthday;
        info!(event = "sync_cycle", latest_height = tip, scanned, "Starting sync cycle");

        match self.tracker.compute_next_state(tip, scanned, birthday)? {
            NextState::Wait {
                latest_height,
                downloaded,
            } => {
                warn!(
                    latest_height,
                    downloaded,
                    "Remote tip is behind local state, waiting"
                );
                self.set_state(SyncState::Synced);
                self.emit(SyncEvent::Idle {
                    latest_height,
                    scanned_height: scanned,
                });
                Ok(CycleOutcome::Waiting {
                    latest_height,
                    downloaded,
                })
            }
            NextState::FinishProcessing { latest_height } => self.finish(latest_height).await,
            NextState::ProcessNewBlocks(ranges) => {
                self.process(ranges, cancel).await?;
                self.finish(tip).await
            }
        }
    }

    /// Pull the downloaded cursor back when the cache lost blocks it claims
    fn repair_downloaded_cursor(&self) -> Result<()> {
        let progress = self.tracker.snapshot()?;
        let cached = self.cache.latest_height()?.unwrap_or(0);
        if cached >= progress.downloaded {
            return Ok(());
        }

        let target = if cached >= progress.scanned {
            cached
        } else {
            self.cache.clear()?;
            progress.scanned
        };
        warn!(
            downloaded = progress.downloaded,
            cached,
            target,
            "Block cache is behind the downloaded cursor"
        );
        self.tracker.rewind_cursor(ProgressKey::Downloaded, target)
    }

    async fn process(&self, ranges: SyncRanges, cancel: &CancelToken) -> Result<()> {
        match (ranges.download, ranges.scan) {
            (download, Some(scan)) => self.download_validate_scan(download, scan, cancel).await?,
            (Some(download), None) => self.download_only(download, cancel).await?,
            (None, None) => {}
        }

        if let Some(range) = ranges.enhance {
            self.enhance(range, cancel).await?;
        }

        if let Some(range) = ranges.fetch_utxo {
            self.fetch_utxos(range, cancel).await?;
        }

        Ok(())
    }

    /// Drop cached blocks that cannot extend the cache contiguously from
    /// where the downloader will resume.
    fn reconcile_cache(&self, download: BlockRange) -> Result<()> {
        let start = download.lower.max(self.tracker.downloaded()? + 1);
        if let Some(latest) = self.cache.latest_height()? {
            if latest.saturating_add(1) < start {
                warn!(
                    latest,
                    start,
                    "Cached blocks do not reach the download start, clearing cache"
                );
                self.cache.clear()?;
            }
        }
        Ok(())
    }

    async fn start_download(&self, download: BlockRange, limit: BlockHeight) -> Result<()> {
        self.reconcile_cache(download)?;
        self.downloader.configure(download, self.config.batch_size);
        self.downloader.set_limit(limit.min(download.upper));
        self.downloader.start(self.config.download_buffer_size).await;
        self.emit(SyncEvent::PhaseStarted {
            phase: SyncPhase::Download,
            range: download,
        });
        Ok(())
    }

    async fn download_only(&self, download: BlockRange, cancel: &CancelToken) -> Result<()> {
        self.set_state(SyncState::Downloading);
        self.start_download(download, download.upper).await?;
        let result = cancel
            .run(self.downloader.wait_until_downloaded(download))
            .await;
        self.downloader.stop().await;
        result?;
        self.progress_event(SyncPhase::Download, download, download.upper);
        Ok(())
    }

    async fn download_validate_scan(
        &self,
        download: Option<BlockRange>,
        scan: BlockRange,
        cancel: &CancelToken,
    ) -> Result<()> {
        let batch_size = self.config.batch_size;

        if let Some(download) = download {
            self.set_state(SyncState::Downloading);
            let first_upper = scan.lower.saturating_add(batch_size.saturating_mul(2) - 1);
            self.start_download(download, first_upper).await?;
        }
        self.emit(SyncEvent::PhaseStarted {
            phase: SyncPhase::Validate,
            range: scan,
        });
        self.emit(SyncEvent::PhaseStarted {
            phase: SyncPhase::Scan,
            range: scan,
        });

        let result: Result<()> = async {
            for batch in scan.batches(batch_size) {
                cancel.check()?;

                if let Some(download) = download {
                    if batch.upper >= download.lower {
                        self.set_state(SyncState::Downloading);
                        self.downloader
                            .set_limit(batch.upper.saturating_add(batch_size).min(download.upper));
                        cancel
                            .run(self.downloader.wait_until_downloaded(batch))
                            .await?;
                        self.progress_event(SyncPhase::Download, download, batch.upper);
                    }
                }

                self.set_state(SyncState::Validating);
                let started = Instant::now();
                validate_chain(self.cache.as_ref(), batch)?;
                self.perf.record(SyncPhase::Validate, batch, started.elapsed());
                self.progress_event(SyncPhase::Validate, scan, batch.upper);

                self.set_state(SyncState::Scanning);
                self.scan_batch(batch, cancel).await?;
                self.progress_event(SyncPhase::Scan, scan, batch.upper);
            }
            Ok(())
        }
        .await;

        if download.is_some() {
            self.downloader.stop().await;
        }
        result
    }

    async fn scan_batch(&self, batch: BlockRange, cancel: &CancelToken) -> Result<()> {
        let mut next = batch.lower;
        while next <= batch.upper {
            let range = BlockRange::new(next, batch.upper);
            let started = Instant::now();
            let summary = cancel.run(self.scanner.scan_and_persist(range)).await?;

            let scanned_upper = summary.scanned_range.upper.min(batch.upper);
            if scanned_upper < next {
                return Err(Error::Scanner(format!(
                    "scanner made no progress at height {}",
                    next
                )));
            }

            self.tracker.advance(ProgressKey::Scanned, scanned_upper)?;
            let done = BlockRange::new(next, scanned_upper);
            self.perf.record(SyncPhase::Scan, done, started.elapsed());
            debug!(
                lower = done.lower,
                upper = done.upper,
                received = summary.received_notes,
                spent = summary.spent_notes,
                "Scanned blocks"
            );
            next = scanned_upper + 1;
        }
        Ok(())
    }

    async fn enhance(&self, range: BlockRange, cancel: &CancelToken) -> Result<()> {
        let scanned = self.tracker.scanned()?;
        let Some(range) = BlockRange::checked(range.lower, range.upper.min(scanned)) else {
            return Ok(());
        };

        self.set_state(SyncState::Enhancing);
        self.emit(SyncEvent::PhaseStarted {
            phase: SyncPhase::Enhance,
            range,
        });

        for batch in range.batches(self.config.enhance_batch_size) {
            cancel.check()?;
            let started = Instant::now();
            if let Some(enhancer) = &self.enhancer {
                let summary = cancel.run(enhancer.enhance(batch)).await?;
                debug!(
                    lower = batch.lower,
                    upper = batch.upper,
                    transactions = summary.transactions,
                    "Enhanced transactions"
                );
            }
            self.tracker.advance(ProgressKey::Enhanced, batch.upper)?;
            self.perf.record(SyncPhase::Enhance, batch, started.elapsed());
            self.progress_event(SyncPhase::Enhance, range, batch.upper);
        }
        Ok(())
    }

    async fn fetch_utxos(&self, range: BlockRange, cancel: &CancelToken) -> Result<()> {
        self.set_state(SyncState::FetchingUtxo);
        self.emit(SyncEvent::PhaseStarted {
            phase: SyncPhase::FetchUtxo,
            range,
        });

        let started = Instant::now();
        if let Some(fetcher) = &self.utxo_fetcher {
            let summary = cancel.run(fetcher.fetch_utxos(range)).await?;
            debug!(inserted = summary.inserted, "Fetched UTXOs");
        }
        self.tracker.advance(ProgressKey::UtxoFetched, range.upper)?;
        self.perf.record(SyncPhase::FetchUtxo, range, started.elapsed());
        self.progress_event(SyncPhase::FetchUtxo, range, range.upper);
        Ok(())
    }

    async fn finish(&self, latest_height: BlockHeight) -> Result<CycleOutcome> {
        self.clear_scanned_blocks()?;

        let scanned_height = self.tracker.scanned()?;
        let tip_moved = match self.source.latest_height().await {
            Ok(tip) => tip > latest_height,
            Err(e) => {
                debug!("Could not re-check tip: {}", e);
                false
            }
        };

        self.set_state(SyncState::Synced);
        self.emit(SyncEvent::Idle {
            latest_height,
            scanned_height,
        });
        info!(
            event = "sync_idle",
            latest_height,
            scanned_height,
            tip_moved,
            "Sync cycle finished"
        );

        Ok(CycleOutcome::Synced {
            latest_height,
            scanned_height,
            tip_moved,
        })
    }

    fn clear_scanned_blocks(&self) -> Result<()> {
        let Some(retained) = self.config.retained_scanned_blocks else {
            return Ok(());
        };
        let scanned = self.tracker.scanned()?;
        if scanned > retained {
            self.cache.prune(scanned - retained)?;
        }
        Ok(())
    }

    /// `consecutive` counts reorgs already handled in this cycle
    async fn handle_reorg(&self, reorg_height: BlockHeight, consecutive: u32) -> Result<()> {
        if consecutive >= self.config.max_consecutive_reorgs {
            return Err(Error::Protocol(format!(
                "gave up after {} consecutive reorgs, last at {}",
                consecutive, reorg_height
            )));
        }

        self.set_state(SyncState::HandlingReorg);
        let rewind_height =
            self.config
                .rewind_policy
                .rewind_height(reorg_height, consecutive, self.config.birthday);

        warn!(
            event = "reorg_detected",
            reorg_height,
            rewind_height,
            consecutive,
            "Chain reorg detected, rewinding"
        );
        self.apply_rewind(rewind_height).await?;
        self.emit(SyncEvent::ReorgHandled {
            reorg_height,
            rewind_height,
        });
        Ok(())
    }

    async fn apply_rewind(&self, height: BlockHeight) -> Result<()> {
        self.downloader.stop().await;
        self.tracker.rewind(height)?;
        self.cache.rewind(height)?;
        self.scanner.rewind_cache(height).await?;
        self.downloader.reset();
        Ok(())
    }

    async fn rewind(&self, requested: Option<BlockHeight>) -> Result<BlockHeight> {
        let height = match requested {
            Some(height) => height,
            None => self.tracker.scanned()?,
        }
        .max(self.config.birthday);

        self.apply_rewind(height).await?;
        info!(event = "rewind", height, "Rewound sync state");
        Ok(height)
    }

    async fn wipe(&self) -> Result<()> {
        self.downloader.stop().await;
        self.cache.clear()?;
        self.tracker.reset()?;
        self.scanner.rewind_cache(0).await?;
        self.downloader.reset();
        self.set_state(SyncState::Unprepared);
        info!(event = "wipe", "Wiped sync state");
        Ok(())
    }
}
