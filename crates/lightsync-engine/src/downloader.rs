//! Block downloader: pulls ranges from a [`BlockSource`] into a [`BlockCache`].
//!
//! A run always resumes from the persisted downloaded cursor. Blocks are
//! buffered and flushed in groups of `max_buffer_size`; the cursor only
//! moves after a flush succeeded. The remote stream is kept between
//! batches (and between runs) until it no longer covers the next batch or
//! has delivered more than `stream_batch_multiplier * batch_size` blocks.

use crate::cancel::CancelToken;
use crate::events::SyncPhase;
use crate::metrics::PerfCounters;
use crate::progress::SyncProgressTracker;
use crate::source::{BlockSource, BlockStream};
use crate::{Error, Result};
use futures::StreamExt;
use lightsync_params::defaults::DOWNLOAD_POLL_INTERVAL;
use lightsync_storage::{BlockCache, BlockHeight, BlockRange, CompactBlock, ProgressKey};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct Settings {
    range: Option<BlockRange>,
    batch_size: u64,
    limit: Option<BlockHeight>,
}

struct ActiveStream {
    /// Range the stream was opened for
    window: BlockRange,
    next_height: BlockHeight,
    delivered: u64,
    blocks: BlockStream,
}

struct RunHandle {
    cancel: CancelToken,
    task: JoinHandle<()>,
}

struct Inner {
    source: Arc<dyn BlockSource>,
    cache: Arc<dyn BlockCache>,
    tracker: Arc<SyncProgressTracker>,
    perf: Arc<PerfCounters>,
    stream_batch_multiplier: u64,
    settings: Mutex<Settings>,
    limit_changed: Notify,
    parked_stream: Mutex<Option<ActiveStream>>,
    running: AtomicBool,
    last_error: Mutex<Option<Error>>,
}

/// Downloads blocks in the background, one run at a time
pub struct BlockDownloader {
    inner: Arc<Inner>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl BlockDownloader {
    /// Create an idle downloader
    pub fn new(
        source: Arc<dyn BlockSource>,
        cache: Arc<dyn BlockCache>,
        tracker: Arc<SyncProgressTracker>,
        perf: Arc<PerfCounters>,
        stream_batch_multiplier: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                cache,
                tracker,
                perf,
                stream_batch_multiplier: stream_batch_multiplier.max(1),
                settings: Mutex::new(Settings {
                    range: None,
                    batch_size: 1,
                    limit: None,
                }),
                limit_changed: Notify::new(),
                parked_stream: Mutex::new(None),
                running: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Set the range to download and the batch size
    pub fn configure(&self, range: BlockRange, batch_size: u64) {
        let mut settings = self.inner.settings.lock();
        settings.range = Some(range);
        settings.batch_size = batch_size.max(1);
        drop(settings);
        self.inner.limit_changed.notify_one();
    }

    /// Download no further than `height` until raised
    pub fn set_limit(&self, height: BlockHeight) {
        self.inner.settings.lock().limit = Some(height);
        self.inner.limit_changed.notify_one();
    }

    /// Whether a run is in progress
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Error that ended the last run, if any
    pub fn last_error(&self) -> Option<Error> {
        self.inner.last_error.lock().clone()
    }

    /// Start a run. A no-op while a run is active.
    pub async fn start(&self, max_buffer_size: usize) {
        let mut run = self.run.lock().await;
        if self.is_running() {
            debug!("Download run already active");
            return;
        }
        if let Some(previous) = run.take() {
            let _ = previous.task.await;
        }

        *self.inner.last_error.lock() = None;
        self.inner.running.store(true, Ordering::Release);

        let cancel = CancelToken::new();
        let inner = self.inner.clone();
        let task = tokio::spawn(inner.run(cancel.clone(), max_buffer_size.max(1)));
        *run = Some(RunHandle { cancel, task });
    }

    /// Cancel the active run and wait until it has exited
    pub async fn stop(&self) {
        let handle = self.run.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!("Download task ended abnormally: {}", e);
            }
        }
        self.inner.parked_stream.lock().take();
    }

    /// Forget the kept stream and any recorded error; call after the cache
    /// was rewound underneath the downloader.
    pub fn reset(&self) {
        self.inner.parked_stream.lock().take();
        *self.inner.last_error.lock() = None;
    }

    /// Wait until the downloaded cursor reaches `range.upper`.
    ///
    /// Polls the persisted cursor; returns the error that ended the run, or
    /// an error when the run ended short of the target.
    pub async fn wait_until_downloaded(&self, range: BlockRange) -> Result<()> {
        loop {
            let downloaded = self.inner.tracker.downloaded()?;
            if downloaded >= range.upper {
                return Ok(());
            }
            if let Some(e) = self.last_error() {
                return Err(e);
            }
            if !self.is_running() {
                // The run records its error before clearing `running`
                if let Some(e) = self.last_error() {
                    return Err(e);
                }
                let downloaded = self.inner.tracker.downloaded()?;
                if downloaded >= range.upper {
                    return Ok(());
                }
                return Err(Error::Sync(format!(
                    "download run ended at {} before reaching {}",
                    downloaded, range.upper
                )));
            }
            tokio::time::sleep(DOWNLOAD_POLL_INTERVAL).await;
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, cancel: CancelToken, max_buffer_size: usize) {
        let mut stream = self.parked_stream.lock().take();

        match self.download(&cancel, max_buffer_size, &mut stream).await {
            Ok(()) => {
                *self.parked_stream.lock() = stream;
            }
            Err(Error::Cancelled) => {
                debug!("Download run cancelled");
            }
            Err(e) => {
                warn!(event = "download_failed", error = %e, "Download run failed");
                *self.last_error.lock() = Some(e);
            }
        }

        self.running.store(false, Ordering::Release);
    }

    async fn download(
        &self,
        cancel: &CancelToken,
        max_buffer_size: usize,
        stream: &mut Option<ActiveStream>,
    ) -> Result<()> {
        loop {
            cancel.check()?;

            let settings = *self.settings.lock();
            let Some(range) = settings.range else {
                return Err(Error::Sync("downloader started before configure".into()));
            };

            let downloaded = self.tracker.downloaded()?;
            let lower = range.lower.max(downloaded + 1);
            let upper = settings
                .limit
                .map_or(range.upper, |limit| limit.min(range.upper));

            if lower > range.upper {
                info!(
                    event = "download_complete",
                    upper = range.upper,
                    "Download range complete"
                );
                return Ok(());
            }

            if lower > upper {
                tokio::select! {
                    _ = self.limit_changed.notified() => continue,
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }

            let batch_upper = lower.saturating_add(settings.batch_size - 1).min(upper);
            let batch = BlockRange::new(lower, batch_upper);
            self.download_batch(
                cancel,
                batch,
                range,
                settings.batch_size,
                max_buffer_size,
                stream,
            )
            .await?;
        }
    }

    async fn download_batch(
        &self,
        cancel: &CancelToken,
        batch: BlockRange,
        range: BlockRange,
        batch_size: u64,
        max_buffer_size: usize,
        stream: &mut Option<ActiveStream>,
    ) -> Result<()> {
        let started = Instant::now();
        let max_delivered = self.stream_batch_multiplier.saturating_mul(batch_size);

        let reusable = stream.as_ref().is_some_and(|s| {
            s.next_height == batch.lower
                && batch.upper <= s.window.upper
                && s.delivered <= max_delivered
        });

        if !reusable {
            let window = BlockRange::new(batch.lower, range.upper.max(batch.upper));
            debug!(
                lower = window.lower,
                upper = window.upper,
                "Opening block stream"
            );
            let blocks = cancel
                .run(async { self.source.stream_blocks(window).await.map_err(Error::from) })
                .await?;
            *stream = Some(ActiveStream {
                window,
                next_height: batch.lower,
                delivered: 0,
                blocks,
            });
        }

        let Some(active) = stream.as_mut() else {
            return Err(Error::Sync("no block stream".into()));
        };

        let mut buffer: Vec<CompactBlock> = Vec::with_capacity(max_buffer_size);
        for expected in batch.lower..=batch.upper {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                item = active.blocks.next() => item,
            };

            let block = match item {
                Some(Ok(block)) => block,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(Error::Protocol(format!(
                        "block stream ended at {} before {}",
                        expected, batch.upper
                    )))
                }
            };

            if block.height != expected {
                return Err(Error::Protocol(format!(
                    "expected block {} from stream, got {}",
                    expected, block.height
                )));
            }

            active.next_height = expected + 1;
            active.delivered += 1;
            buffer.push(block);

            if buffer.len() >= max_buffer_size {
                self.flush(&mut buffer)?;
            }
        }

        self.flush(&mut buffer)?;
        self.perf.record(SyncPhase::Download, batch, started.elapsed());
        Ok(())
    }

    fn flush(&self, buffer: &mut Vec<CompactBlock>) -> Result<()> {
        let Some(last) = buffer.last().map(|b| b.height) else {
            return Ok(());
        };
        self.cache.append(buffer)?;
        self.tracker.advance(ProgressKey::Downloaded, last)?;
        buffer.clear();
        Ok(())
    }
}
