//! Per-phase sync cursors and next-state computation.
//!
//! Four cursors (downloaded, scanned, enhanced, UTXO fetched) advance
//! independently and persist through a [`ProgressStore`], so an interrupted
//! cycle resumes at the last completed step of each phase.

use crate::Result;
use lightsync_storage::{BlockHeight, BlockRange, ProgressKey, ProgressStore};
use parking_lot::Mutex;

/// Snapshot of all four cursors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Highest height stored in the block cache
    pub downloaded: BlockHeight,
    /// Highest height scanned
    pub scanned: BlockHeight,
    /// Highest height enhanced
    pub enhanced: BlockHeight,
    /// Highest height with UTXOs fetched
    pub utxo_fetched: BlockHeight,
}

impl SyncProgress {
    /// Cursor by key
    pub fn get(&self, key: ProgressKey) -> BlockHeight {
        match key {
            ProgressKey::Downloaded => self.downloaded,
            ProgressKey::Scanned => self.scanned,
            ProgressKey::Enhanced => self.enhanced,
            ProgressKey::UtxoFetched => self.utxo_fetched,
        }
    }
}

/// Work for one cycle. Each range is `None` when its phase is caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRanges {
    /// Remote tip the ranges were computed against
    pub latest_height: BlockHeight,
    /// Blocks to download
    pub download: Option<BlockRange>,
    /// Blocks to validate and scan
    pub scan: Option<BlockRange>,
    /// Blocks to enhance
    pub enhance: Option<BlockRange>,
    /// Blocks to fetch UTXOs for
    pub fetch_utxo: Option<BlockRange>,
}

/// What the engine should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    /// Local state is ahead of the remote; wait for it to catch up
    Wait {
        /// Remote tip
        latest_height: BlockHeight,
        /// Local downloaded cursor
        downloaded: BlockHeight,
    },
    /// Some phase is behind the tip
    ProcessNewBlocks(SyncRanges),
    /// Every phase is at the tip
    FinishProcessing {
        /// Remote tip
        latest_height: BlockHeight,
    },
}

/// Range a phase still has to process
fn phase_range(
    cursor: BlockHeight,
    birthday: BlockHeight,
    tip: BlockHeight,
) -> Option<BlockRange> {
    if cursor >= tip {
        return None;
    }
    let lower = if cursor <= birthday { birthday } else { cursor + 1 };
    BlockRange::checked(lower, tip)
}

/// Serialized access to the persisted cursors
pub struct SyncProgressTracker {
    store: Box<dyn ProgressStore>,
    lock: Mutex<()>,
}

impl SyncProgressTracker {
    /// Track cursors persisted in `store`
    pub fn new(store: Box<dyn ProgressStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Read one cursor
    pub fn get(&self, key: ProgressKey) -> Result<BlockHeight> {
        let _guard = self.lock.lock();
        Ok(self.store.load(key)?)
    }

    /// Downloaded cursor
    pub fn downloaded(&self) -> Result<BlockHeight> {
        self.get(ProgressKey::Downloaded)
    }

    /// Scanned cursor
    pub fn scanned(&self) -> Result<BlockHeight> {
        self.get(ProgressKey::Scanned)
    }

    /// All cursors, read under one lock
    pub fn snapshot(&self) -> Result<SyncProgress> {
        let _guard = self.lock.lock();
        Ok(SyncProgress {
            downloaded: self.store.load(ProgressKey::Downloaded)?,
            scanned: self.store.load(ProgressKey::Scanned)?,
            enhanced: self.store.load(ProgressKey::Enhanced)?,
            utxo_fetched: self.store.load(ProgressKey::UtxoFetched)?,
        })
    }

    /// Move a cursor forward to `height`. Lower values are ignored; only
    /// [`Self::rewind`] moves cursors back.
    pub fn advance(&self, key: ProgressKey, height: BlockHeight) -> Result<()> {
        let _guard = self.lock.lock();
        let current = self.store.load(key)?;
        if height > current {
            self.store.store(key, height)?;
        } else if height < current {
            tracing::debug!(
                key = key.as_str(),
                current,
                requested = height,
                "Ignoring backwards cursor update"
            );
        }
        Ok(())
    }

    /// Clamp every cursor to `min(cursor, height)` in one atomic write
    pub fn rewind(&self, height: BlockHeight) -> Result<()> {
        let _guard = self.lock.lock();
        let mut values = Vec::with_capacity(ProgressKey::ALL.len());
        for key in ProgressKey::ALL {
            values.push((key, self.store.load(key)?.min(height)));
        }
        self.store.store_all(&values)?;
        Ok(())
    }

    /// Lower a single cursor to `min(cursor, height)`
    pub fn rewind_cursor(&self, key: ProgressKey, height: BlockHeight) -> Result<()> {
        let _guard = self.lock.lock();
        let current = self.store.load(key)?;
        if height < current {
            self.store.store(key, height)?;
        }
        Ok(())
    }

    /// Zero every cursor
    pub fn reset(&self) -> Result<()> {
        self.rewind(0)
    }

    /// Seed the downloaded cursor from the cache when nothing was recorded
    /// yet, e.g. for caches filled before cursors were persisted.
    pub fn migrate_if_needed(&self, latest_cached: BlockHeight) -> Result<bool> {
        let _guard = self.lock.lock();
        if latest_cached == 0 || self.store.load(ProgressKey::Downloaded)? != 0 {
            return Ok(false);
        }
        self.store.store(ProgressKey::Downloaded, latest_cached)?;
        tracing::info!(
            event = "progress_migrated",
            downloaded = latest_cached,
            "Seeded downloaded cursor from block cache"
        );
        Ok(true)
    }

    /// Decide the next unit of work against the remote tip.
    ///
    /// Each phase range is `[max(birthday, cursor + 1), tip]`; a cursor at or
    /// below the birthday starts at the birthday. `scanned_height` stands in
    /// for the scanned cursor.
    pub fn compute_next_state(
        &self,
        tip: BlockHeight,
        scanned_height: BlockHeight,
        birthday: BlockHeight,
    ) -> Result<NextState> {
        let progress = SyncProgress {
            scanned: scanned_height,
            ..self.snapshot()?
        };

        tracing::debug!(
            latest_height = tip,
            downloaded = progress.downloaded,
            scanned = progress.scanned,
            enhanced = progress.enhanced,
            utxo_fetched = progress.utxo_fetched,
            "Computing next sync state"
        );

        let cursors = [
            progress.downloaded,
            progress.scanned,
            progress.enhanced,
            progress.utxo_fetched,
        ];

        if cursors.iter().any(|&c| c > tip) {
            return Ok(NextState::Wait {
                latest_height: tip,
                downloaded: progress.downloaded,
            });
        }

        if cursors.iter().all(|&c| c == tip) {
            return Ok(NextState::FinishProcessing { latest_height: tip });
        }

        if progress.scanned > progress.downloaded {
            tracing::warn!(
                downloaded = progress.downloaded,
                scanned = progress.scanned,
                "Scanned cursor ahead of downloaded cursor"
            );
        }

        Ok(NextState::ProcessNewBlocks(SyncRanges {
            latest_height: tip,
            download: phase_range(progress.downloaded, birthday, tip),
            scan: phase_range(progress.scanned, birthday, tip),
            enhance: phase_range(progress.enhanced, birthday, tip),
            fetch_utxo: phase_range(progress.utxo_fetched, birthday, tip),
        }))
    }
}
