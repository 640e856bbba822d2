//! Data model shared by the cache backends and the sync engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height
pub type BlockHeight = u64;

/// Highest height SQLite can store
pub const MAX_STORED_HEIGHT: BlockHeight = i64::MAX as BlockHeight;

/// Height as a query bound. Heights past SQLite's range saturate, which
/// keeps `> h` and `<= h` comparisons correct.
pub(crate) fn sql_bound(height: BlockHeight) -> i64 {
    i64::try_from(height).unwrap_or(i64::MAX)
}

/// Height as a stored value
pub(crate) fn sql_height(height: BlockHeight) -> crate::Result<i64> {
    i64::try_from(height).map_err(|_| crate::Error::HeightOutOfRange(height))
}

/// Closed height interval `[lower, upper]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    /// First height in the range
    pub lower: BlockHeight,
    /// Last height in the range (inclusive)
    pub upper: BlockHeight,
}

impl BlockRange {
    /// Create a range. `lower` must not exceed `upper`.
    pub fn new(lower: BlockHeight, upper: BlockHeight) -> Self {
        debug_assert!(lower <= upper, "inverted range [{}, {}]", lower, upper);
        Self { lower, upper }
    }

    /// Create a range, or `None` when `lower > upper`
    pub fn checked(lower: BlockHeight, upper: BlockHeight) -> Option<Self> {
        (lower <= upper).then_some(Self { lower, upper })
    }

    /// Number of heights covered
    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }

    /// A closed range is never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `height` lies in the range
    pub fn contains(&self, height: BlockHeight) -> bool {
        self.lower <= height && height <= self.upper
    }

    /// Whether `other` lies entirely inside this range
    pub fn covers(&self, other: &BlockRange) -> bool {
        self.lower <= other.lower && other.upper <= self.upper
    }

    /// Consecutive sub-ranges of at most `size` heights
    pub fn batches(&self, size: u64) -> impl Iterator<Item = BlockRange> {
        let size = size.max(1);
        let upper = self.upper;
        let mut next = Some(self.lower);
        std::iter::from_fn(move || {
            let lower = next?;
            let end = lower.saturating_add(size - 1).min(upper);
            next = (end < upper).then(|| end + 1);
            Some(BlockRange::new(lower, end))
        })
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// Per-block metadata kept alongside the raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Block hash in internal byte order
    pub hash: Vec<u8>,
    /// Hash of the previous block in internal byte order
    pub prev_hash: Vec<u8>,
    /// Block time (Unix epoch)
    pub time: u32,
    /// Sapling outputs in the block
    pub sapling_outputs: u32,
    /// Orchard actions in the block
    pub orchard_actions: u32,
}

/// Compact block as stored in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactBlock {
    /// Block height
    pub height: BlockHeight,
    /// Opaque encoded block, handed to the note scanner untouched
    pub raw: Vec<u8>,
    /// Metadata
    pub meta: BlockMeta,
}

impl CompactBlock {
    /// Block hash in display order (byte-reversed hex)
    pub fn hash_hex(&self) -> String {
        display_hex(&self.meta.hash)
    }
}

/// Byte-reversed hex, the order block explorers show hashes in
pub fn display_hex(hash: &[u8]) -> String {
    let mut bytes = hash.to_vec();
    bytes.reverse();
    hex::encode(bytes)
}

/// Inverse of [`display_hex`]
pub fn parse_display_hex(s: &str) -> Option<Vec<u8>> {
    let mut bytes = hex::decode(s).ok()?;
    bytes.reverse();
    Some(bytes)
}
