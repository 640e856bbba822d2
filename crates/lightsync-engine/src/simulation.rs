//! In-memory chain and wallet stand-ins for tests and the sync harness.
//!
//! [`SimulatedChain`] serves deterministic blocks whose hashes commit to
//! height and fork, so a reorg is scripted by switching the fork from some
//! height upwards. [`RecordingScanner`] plays scanner, enhancer and UTXO
//! fetcher and records every call.

use crate::source::{BlockSource, BlockStream};
use crate::wallet::{
    EnhanceSummary, NoteScanner, ScanSummary, TransactionEnhancer, UtxoFetcher, UtxoSummary,
};
use crate::{Error, Result, ServiceError};
use async_trait::async_trait;
use lightsync_storage::{BlockCache, BlockHeight, BlockMeta, BlockRange, CompactBlock};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Block hash for `height` on fork `fork`
pub fn simulated_hash(height: BlockHeight, fork: u32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"lightsync-sim");
    hasher.update(height.to_le_bytes());
    hasher.update(fork.to_le_bytes());
    hasher.finalize().to_vec()
}

#[derive(Default)]
struct ChainState {
    tip: BlockHeight,
    /// `(height, fork)`: blocks from `height` up belong to `fork`
    fork_points: Vec<(BlockHeight, u32)>,
    next_fork: u32,
    tip_failures: VecDeque<ServiceError>,
    stream_failure: Option<(BlockHeight, ServiceError)>,
    tip_queries: usize,
    stream_opens: usize,
    fetched: Vec<BlockHeight>,
}

impl ChainState {
    fn fork_at(&self, height: BlockHeight) -> u32 {
        self.fork_points
            .iter()
            .rev()
            .find(|(from, _)| *from <= height)
            .map_or(0, |(_, fork)| *fork)
    }

    fn block(&self, height: BlockHeight) -> CompactBlock {
        let hash = simulated_hash(height, self.fork_at(height));
        let prev_hash = if height == 0 {
            vec![0; 32]
        } else {
            simulated_hash(height - 1, self.fork_at(height - 1))
        };

        let mut raw = height.to_le_bytes().to_vec();
        raw.extend_from_slice(&hash);

        CompactBlock {
            height,
            raw,
            meta: BlockMeta {
                hash,
                prev_hash,
                time: 1_600_000_000u32.wrapping_add((height as u32).wrapping_mul(75)),
                sapling_outputs: (height % 3) as u32,
                orchard_actions: (height % 2) as u32,
            },
        }
    }
}

/// Scriptable remote chain
#[derive(Clone)]
pub struct SimulatedChain {
    state: Arc<Mutex<ChainState>>,
    block_delay: Duration,
}

impl SimulatedChain {
    /// Chain whose tip is `tip`
    pub fn new(tip: BlockHeight) -> Self {
        let state = ChainState {
            tip,
            next_fork: 1,
            ..ChainState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            block_delay: Duration::ZERO,
        }
    }

    /// Delay every streamed block by `delay`
    pub fn with_block_delay(mut self, delay: Duration) -> Self {
        self.block_delay = delay;
        self
    }

    /// Current tip
    pub fn tip(&self) -> BlockHeight {
        self.state.lock().tip
    }

    /// Move the tip
    pub fn set_tip(&self, tip: BlockHeight) {
        self.state.lock().tip = tip;
    }

    /// Mine `count` blocks
    pub fn advance_tip(&self, count: u64) {
        self.state.lock().tip += count;
    }

    /// Replace every block from `height` up with a new fork
    pub fn reorg_from(&self, height: BlockHeight) {
        let mut state = self.state.lock();
        state.fork_points.retain(|(from, _)| *from < height);
        let fork = state.next_fork;
        state.next_fork += 1;
        state.fork_points.push((height, fork));
    }

    /// Block at `height` as the chain currently has it
    pub fn block(&self, height: BlockHeight) -> CompactBlock {
        self.state.lock().block(height)
    }

    /// Blocks `range` as the chain currently has them
    pub fn blocks(&self, range: BlockRange) -> Vec<CompactBlock> {
        let state = self.state.lock();
        (range.lower..=range.upper).map(|h| state.block(h)).collect()
    }

    /// Fail the next `count` tip queries with `error`
    pub fn fail_tip_queries(&self, count: usize, error: ServiceError) {
        let mut state = self.state.lock();
        state.tip_failures.extend(std::iter::repeat(error).take(count));
    }

    /// Fail the stream once, in place of the block at `height`
    pub fn fail_stream_at(&self, height: BlockHeight, error: ServiceError) {
        self.state.lock().stream_failure = Some((height, error));
    }

    /// Tip queries answered or failed so far
    pub fn tip_queries(&self) -> usize {
        self.state.lock().tip_queries
    }

    /// Streams opened so far
    pub fn stream_opens(&self) -> usize {
        self.state.lock().stream_opens
    }

    /// Heights delivered so far, in delivery order
    pub fn fetched_heights(&self) -> Vec<BlockHeight> {
        self.state.lock().fetched.clone()
    }

    /// Forget the fetch log
    pub fn clear_fetched(&self) {
        self.state.lock().fetched.clear();
    }
}

#[async_trait]
impl BlockSource for SimulatedChain {
    async fn latest_height(&self) -> std::result::Result<BlockHeight, ServiceError> {
        let mut state = self.state.lock();
        state.tip_queries += 1;
        match state.tip_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(state.tip),
        }
    }

    async fn stream_blocks(
        &self,
        range: BlockRange,
    ) -> std::result::Result<BlockStream, ServiceError> {
        self.state.lock().stream_opens += 1;

        let state = self.state.clone();
        let delay = self.block_delay;
        let stream = futures::stream::unfold(range.lower, move |height| {
            let state = state.clone();
            async move {
                if height > range.upper {
                    return None;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let mut state = state.lock();
                if height > state.tip {
                    return None;
                }
                if state
                    .stream_failure
                    .as_ref()
                    .is_some_and(|(at, _)| *at == height)
                {
                    let (_, error) = state.stream_failure.take()?;
                    // Ends the stream after the error
                    return Some((Err(error), range.upper + 1));
                }
                state.fetched.push(height);
                Some((Ok(state.block(height)), height + 1))
            }
        });

        Ok(Box::pin(stream))
    }
}

#[derive(Default)]
struct Recorded {
    scanned: Vec<BlockRange>,
    enhanced: Vec<BlockRange>,
    utxo_fetched: Vec<BlockRange>,
    rewinds: Vec<BlockHeight>,
    latest_scanned: BlockHeight,
    scan_failures: VecDeque<Error>,
}

/// Wallet stand-in that records what the engine asks of it
#[derive(Default)]
pub struct RecordingScanner {
    recorded: Mutex<Recorded>,
    cache: Option<Arc<dyn BlockCache>>,
    max_blocks_per_call: Option<u64>,
    scan_delay: Duration,
}

impl RecordingScanner {
    /// Scanner that accepts every range
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every scanned range from `cache`, failing when blocks are missing
    pub fn with_cache(mut self, cache: Arc<dyn BlockCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Scan at most `count` blocks per call
    pub fn with_max_blocks_per_call(mut self, count: u64) -> Self {
        self.max_blocks_per_call = Some(count.max(1));
        self
    }

    /// Sleep `delay` in every scan call
    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = delay;
        self
    }

    /// Fail the next scan call with `error`
    pub fn fail_next_scan(&self, error: Error) {
        self.recorded.lock().scan_failures.push_back(error);
    }

    /// Ranges scanned, in call order
    pub fn scanned_ranges(&self) -> Vec<BlockRange> {
        self.recorded.lock().scanned.clone()
    }

    /// Ranges enhanced, in call order
    pub fn enhanced_ranges(&self) -> Vec<BlockRange> {
        self.recorded.lock().enhanced.clone()
    }

    /// Ranges UTXOs were fetched for, in call order
    pub fn utxo_ranges(&self) -> Vec<BlockRange> {
        self.recorded.lock().utxo_fetched.clone()
    }

    /// Heights rewound to, in call order
    pub fn rewinds(&self) -> Vec<BlockHeight> {
        self.recorded.lock().rewinds.clone()
    }
}

#[async_trait]
impl NoteScanner for RecordingScanner {
    async fn scan_and_persist(&self, range: BlockRange) -> Result<ScanSummary> {
        if let Some(error) = self.recorded.lock().scan_failures.pop_front() {
            return Err(error);
        }
        if !self.scan_delay.is_zero() {
            tokio::time::sleep(self.scan_delay).await;
        }

        let upper = match self.max_blocks_per_call {
            Some(max) => range.upper.min(range.lower + max - 1),
            None => range.upper,
        };
        let scanned_range = BlockRange::new(range.lower, upper);

        let mut received_notes = 0;
        if let Some(cache) = &self.cache {
            let blocks = cache.load_range(scanned_range)?;
            if blocks.len() as u64 != scanned_range.len() {
                return Err(Error::Scanner(format!(
                    "cache holds {} of {} blocks in {}",
                    blocks.len(),
                    scanned_range.len(),
                    scanned_range
                )));
            }
            received_notes = blocks
                .iter()
                .map(|b| u64::from(b.meta.sapling_outputs + b.meta.orchard_actions))
                .sum();
        }

        let mut recorded = self.recorded.lock();
        recorded.scanned.push(scanned_range);
        recorded.latest_scanned = recorded.latest_scanned.max(upper);
        Ok(ScanSummary {
            scanned_range,
            spent_notes: 0,
            received_notes,
        })
    }

    async fn rewind_cache(&self, height: BlockHeight) -> Result<()> {
        let mut recorded = self.recorded.lock();
        recorded.rewinds.push(height);
        recorded.latest_scanned = recorded.latest_scanned.min(height);
        Ok(())
    }

    async fn latest_cached_height(&self) -> Result<BlockHeight> {
        Ok(self.recorded.lock().latest_scanned)
    }
}

#[async_trait]
impl TransactionEnhancer for RecordingScanner {
    async fn enhance(&self, range: BlockRange) -> Result<EnhanceSummary> {
        self.recorded.lock().enhanced.push(range);
        Ok(EnhanceSummary {
            range,
            transactions: 0,
        })
    }
}

#[async_trait]
impl UtxoFetcher for RecordingScanner {
    async fn fetch_utxos(&self, range: BlockRange) -> Result<UtxoSummary> {
        self.recorded.lock().utxo_fetched.push(range);
        Ok(UtxoSummary { range, inserted: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_chain_links_blocks() {
        let chain = SimulatedChain::new(20);
        let blocks = chain.blocks(BlockRange::new(10, 12));
        assert_eq!(blocks[1].meta.prev_hash, blocks[0].meta.hash);
        assert_eq!(blocks[2].meta.prev_hash, blocks[1].meta.hash);
        assert_eq!(chain.latest_height().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_reorg_changes_hashes_from_height() {
        let chain = SimulatedChain::new(20);
        let before = chain.blocks(BlockRange::new(14, 16));
        chain.reorg_from(15);
        let after = chain.blocks(BlockRange::new(14, 16));

        assert_eq!(before[0], after[0]);
        assert_ne!(before[1].meta.hash, after[1].meta.hash);
        assert_eq!(after[1].meta.prev_hash, before[0].meta.hash);
        assert_eq!(after[2].meta.prev_hash, after[1].meta.hash);
    }

    #[tokio::test]
    async fn test_stream_records_and_stops_at_tip() {
        let chain = SimulatedChain::new(12);
        let stream = chain.stream_blocks(BlockRange::new(10, 15)).await.unwrap();
        let heights: Vec<_> = stream.map(|b| b.unwrap().height).collect().await;
        assert_eq!(heights, vec![10, 11, 12]);
        assert_eq!(chain.fetched_heights(), vec![10, 11, 12]);
        assert_eq!(chain.stream_opens(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let chain = SimulatedChain::new(12);
        chain.fail_tip_queries(1, ServiceError::Timeout);
        assert_eq!(chain.latest_height().await, Err(ServiceError::Timeout));
        assert_eq!(chain.latest_height().await, Ok(12));

        chain.fail_stream_at(11, ServiceError::Timeout);
        let stream = chain.stream_blocks(BlockRange::new(10, 12)).await.unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1], Err(ServiceError::Timeout));
    }

    #[tokio::test]
    async fn test_scanner_partial_progress_and_rewind() {
        let scanner = RecordingScanner::new().with_max_blocks_per_call(5);
        let summary = scanner
            .scan_and_persist(BlockRange::new(100, 120))
            .await
            .unwrap();
        assert_eq!(summary.scanned_range, BlockRange::new(100, 104));
        assert_eq!(scanner.latest_cached_height().await.unwrap(), 104);

        scanner.rewind_cache(101).await.unwrap();
        assert_eq!(scanner.latest_cached_height().await.unwrap(), 101);
        assert_eq!(scanner.rewinds(), vec![101]);
    }
}
