//! Default sync tuning values.

use std::time::Duration;

/// Deepest reorg the protocol is expected to produce.
pub const MAX_REORG_SIZE: u64 = 100;

/// Blocks rewound below a detected reorg height.
pub const DEFAULT_REWIND_DISTANCE: u64 = 10;

/// Blocks fetched and scanned per batch.
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Blocks buffered in memory before a cache flush.
pub const DEFAULT_DOWNLOAD_BUFFER_SIZE: usize = 10;

/// Stream is recreated after delivering this many batches worth of blocks.
pub const DEFAULT_STREAM_BATCH_MULTIPLIER: u64 = 10;

/// Blocks per enhancement request.
pub const DEFAULT_ENHANCE_BATCH_SIZE: u64 = 1000;

/// Retry ceiling for transient failures within a cycle.
pub const DEFAULT_RETRIES: u32 = 5;

/// Consecutive reorgs tolerated before a cycle is failed.
pub const DEFAULT_MAX_CONSECUTIVE_REORGS: u32 = 10;

/// Scanned blocks kept in the cache for hash-chain validation.
pub const DEFAULT_RETAINED_SCANNED_BLOCKS: u64 = MAX_REORG_SIZE;

/// Metadata rows written per transaction by the filesystem cache.
pub const STORAGE_BATCH_SIZE: usize = 10;

/// Waiter poll interval for the downloaded cursor.
pub const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Interval between sync cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// First retry delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for the retry delay.
pub const DEFAULT_MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(600);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewind_distance_below_max_reorg() {
        assert!(DEFAULT_REWIND_DISTANCE < MAX_REORG_SIZE);
    }

    #[test]
    fn test_backoff_bounds() {
        assert!(DEFAULT_INITIAL_BACKOFF < DEFAULT_MAX_BACKOFF_INTERVAL);
    }
}
