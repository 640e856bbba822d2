//! Block cache and sync cursor storage
//!
//! Persists downloaded compact blocks keyed by height and the per-phase
//! progress cursors of the sync engine.
//!
//! ## Backends
//!
//! - **[`SqliteBlockCache`]**: every block is a row in one SQLite table
//! - **[`FsBlockCache`]**: one file per block under `blocks/`, with a
//!   SQLite metadata index next to it
//!
//! Both implement [`BlockCache`] and keep the stored heights contiguous.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod block_cache;
mod busy;
pub mod error;
pub mod fs_cache;
pub mod listing;
pub mod metadata;
pub mod models;
pub mod paths;
pub mod progress_store;
pub mod sqlite_cache;

pub use block_cache::BlockCache;
pub use error::{Error, Result};
pub use fs_cache::FsBlockCache;
pub use listing::{BlockFileEntry, SortedDirectoryListing, StdDirectoryListing};
pub use metadata::{BlockMetadataStore, SqliteMetadataStore};
pub use models::{BlockHeight, BlockMeta, BlockRange, CompactBlock, MAX_STORED_HEIGHT};
pub use progress_store::{MemoryProgressStore, ProgressKey, ProgressStore, SqliteProgressStore};
pub use sqlite_cache::SqliteBlockCache;
