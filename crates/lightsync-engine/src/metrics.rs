//! Per-phase performance counters.
//!
//! Updated as a side channel by the downloader and the engine; nothing
//! reads them to make control-flow decisions.

use crate::events::SyncPhase;
use lightsync_storage::BlockRange;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one phase
#[derive(Debug, Default)]
pub struct PhaseCounters {
    /// Blocks processed
    pub blocks: AtomicU64,
    /// Batches processed
    pub batches: AtomicU64,
    /// Total processing time in milliseconds
    pub total_ms: AtomicU64,
    /// Last batch processing time in milliseconds
    pub last_batch_ms: AtomicU64,
}

/// Snapshot of [`PhaseCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfSnapshot {
    /// Blocks processed
    pub blocks: u64,
    /// Batches processed
    pub batches: u64,
    /// Total processing time in milliseconds
    pub total_ms: u64,
    /// Last batch processing time in milliseconds
    pub last_batch_ms: u64,
}

impl PerfSnapshot {
    /// Blocks per second over the recorded time
    pub fn blocks_per_second(&self) -> f64 {
        if self.total_ms == 0 {
            return 0.0;
        }
        self.blocks as f64 / (self.total_ms as f64 / 1000.0)
    }

    /// Average batch time in ms
    pub fn avg_batch_ms(&self) -> u64 {
        if self.batches == 0 {
            return 0;
        }
        self.total_ms / self.batches
    }
}

/// Counters for every phase
#[derive(Debug, Default)]
pub struct PerfCounters {
    download: PhaseCounters,
    validate: PhaseCounters,
    scan: PhaseCounters,
    enhance: PhaseCounters,
    fetch_utxo: PhaseCounters,
}

impl PerfCounters {
    /// Create new perf counters
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, phase: SyncPhase) -> &PhaseCounters {
        match phase {
            SyncPhase::Download => &self.download,
            SyncPhase::Validate => &self.validate,
            SyncPhase::Scan => &self.scan,
            SyncPhase::Enhance => &self.enhance,
            SyncPhase::FetchUtxo => &self.fetch_utxo,
        }
    }

    /// Record a finished batch
    pub fn record(&self, phase: SyncPhase, range: BlockRange, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let counters = self.counters(phase);
        counters.blocks.fetch_add(range.len(), Ordering::Relaxed);
        counters.batches.fetch_add(1, Ordering::Relaxed);
        counters.total_ms.fetch_add(ms, Ordering::Relaxed);
        counters.last_batch_ms.store(ms, Ordering::Relaxed);

        tracing::debug!(
            event = "batch_metrics",
            phase = %phase,
            lower = range.lower,
            upper = range.upper,
            batch_size = range.len(),
            elapsed_ms = ms,
            "Batch finished"
        );
    }

    /// Get snapshot of one phase
    pub fn snapshot(&self, phase: SyncPhase) -> PerfSnapshot {
        let counters = self.counters(phase);
        PerfSnapshot {
            blocks: counters.blocks.load(Ordering::Relaxed),
            batches: counters.batches.load(Ordering::Relaxed),
            total_ms: counters.total_ms.load(Ordering::Relaxed),
            last_batch_ms: counters.last_batch_ms.load(Ordering::Relaxed),
        }
    }

    /// One line per phase that did any work
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for phase in [
            SyncPhase::Download,
            SyncPhase::Validate,
            SyncPhase::Scan,
            SyncPhase::Enhance,
            SyncPhase::FetchUtxo,
        ] {
            let snap = self.snapshot(phase);
            if snap.batches == 0 {
                continue;
            }
            lines.push(format!(
                "{}: {} blocks in {} batches, {:.1} blocks/s, avg {}ms",
                phase,
                snap.blocks,
                snap.batches,
                snap.blocks_per_second(),
                snap.avg_batch_ms()
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let perf = PerfCounters::new();
        perf.record(SyncPhase::Download, BlockRange::new(1, 100), Duration::from_millis(500));
        perf.record(SyncPhase::Download, BlockRange::new(101, 200), Duration::from_millis(500));

        let snap = perf.snapshot(SyncPhase::Download);
        assert_eq!(snap.blocks, 200);
        assert_eq!(snap.batches, 2);
        assert_eq!(snap.avg_batch_ms(), 500);
        assert_eq!(snap.blocks_per_second(), 200.0);
        assert_eq!(perf.snapshot(SyncPhase::Scan), PerfSnapshot::default());
    }

    #[test]
    fn test_summary_skips_idle_phases() {
        let perf = PerfCounters::new();
        perf.record(SyncPhase::Scan, BlockRange::new(1, 10), Duration::from_millis(10));
        let summary = perf.summary();
        assert!(summary.starts_with("scan: 10 blocks"));
        assert!(!summary.contains("download"));
    }
}
