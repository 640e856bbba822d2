//! Wallet-side collaborators driven by the engine.
//!
//! Implementations own the cryptography and the wallet database; they must
//! be idempotent for a given range and crash-safe on their own.

use crate::Result;
use async_trait::async_trait;
use lightsync_storage::{BlockHeight, BlockRange};

/// Outcome of scanning a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    /// Range actually scanned and persisted
    pub scanned_range: BlockRange,
    /// Wallet notes found spent
    pub spent_notes: u64,
    /// Wallet notes received
    pub received_notes: u64,
}

/// Trial-decrypts cached blocks and persists wallet state
#[async_trait]
pub trait NoteScanner: Send + Sync {
    /// Scan cached blocks in `range`. May stop early; the returned
    /// `scanned_range` says how far it got.
    async fn scan_and_persist(&self, range: BlockRange) -> Result<ScanSummary>;

    /// Drop scanner state above `height`
    async fn rewind_cache(&self, height: BlockHeight) -> Result<()>;

    /// Highest block height the scanner knows to be cached, 0 when none
    async fn latest_cached_height(&self) -> Result<BlockHeight>;
}

/// Outcome of enhancing a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhanceSummary {
    /// Range enhanced
    pub range: BlockRange,
    /// Transactions fetched in full
    pub transactions: u64,
}

/// Fetches full transaction data for wallet transactions found by scanning
#[async_trait]
pub trait TransactionEnhancer: Send + Sync {
    /// Enhance wallet transactions mined in `range`
    async fn enhance(&self, range: BlockRange) -> Result<EnhanceSummary>;
}

/// Outcome of a UTXO refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoSummary {
    /// Range covered
    pub range: BlockRange,
    /// UTXOs stored
    pub inserted: u64,
}

/// Fetches unspent transparent outputs for the wallet's transparent receivers
#[async_trait]
pub trait UtxoFetcher: Send + Sync {
    /// Fetch UTXOs created in `range`
    async fn fetch_utxos(&self, range: BlockRange) -> Result<UtxoSummary>;
}
