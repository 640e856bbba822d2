//! Error types

use crate::models::BlockHeight;

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A cache file matched the block naming pattern but could not be parsed
    #[error("Malformed cache entry: {0}")]
    MalformedCacheEntry(String),

    /// Appending would leave a gap in the stored heights
    #[error("Non-contiguous append: cache holds [{lower}, {upper}], batch starts at {first}")]
    NonContiguous {
        /// Lowest stored height
        lower: BlockHeight,
        /// Highest stored height
        upper: BlockHeight,
        /// First height of the rejected batch
        first: BlockHeight,
    },

    /// Appended heights are not strictly consecutive
    #[error("Unordered batch: height {found} follows {previous}")]
    UnorderedBatch {
        /// Height before the break
        previous: BlockHeight,
        /// Height found after it
        found: BlockHeight,
    },

    /// Metadata index references a block file that does not exist
    #[error("Missing block file at height {0}")]
    MissingBlock(BlockHeight),

    /// Height does not fit the storage backend
    #[error("Height {0} out of storable range")]
    HeightOutOfRange(BlockHeight),

    /// Metadata index error
    #[error("Metadata error: {0}")]
    Metadata(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
