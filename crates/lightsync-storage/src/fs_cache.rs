//! Filesystem block cache: one file per block plus a metadata index.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/blockmeta.sqlite
//! <root>/blocks/{height}-{hashHex}-compactblock
//! ```
//!
//! Block files are written to a temp file in `blocks/` and renamed into
//! place, so a crash never leaves a partial file under a block name. The
//! index is only updated after the files exist and is rewound before files
//! are deleted; `initialize` removes any file the index does not reference.

use crate::block_cache::{check_append, BlockCache};
use crate::listing::{block_file_name, SortedDirectoryListing, StdDirectoryListing};
use crate::metadata::{BlockMetadataStore, SqliteMetadataStore};
use crate::models::{BlockHeight, BlockMeta, BlockRange, CompactBlock};
use crate::{Error, Result};
use lightsync_params::defaults::STORAGE_BATCH_SIZE;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Directory holding the block files
pub const BLOCKS_DIR: &str = "blocks";

/// File name of the metadata index
pub const METADATA_FILE: &str = "blockmeta.sqlite";

/// Block cache with one file per block
pub struct FsBlockCache {
    blocks_dir: PathBuf,
    metadata: Box<dyn BlockMetadataStore>,
    listing: Box<dyn SortedDirectoryListing>,
    storage_batch_size: usize,
    write_lock: Mutex<()>,
}

impl FsBlockCache {
    /// Open (or create) a cache rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let metadata = SqliteMetadataStore::open(root.join(METADATA_FILE))?;
        Self::with_parts(root, Box::new(metadata), Box::new(StdDirectoryListing))
    }

    /// Build a cache from an explicit index and directory listing
    pub fn with_parts(
        root: impl AsRef<Path>,
        metadata: Box<dyn BlockMetadataStore>,
        listing: Box<dyn SortedDirectoryListing>,
    ) -> Result<Self> {
        let cache = Self {
            blocks_dir: root.as_ref().join(BLOCKS_DIR),
            metadata,
            listing,
            storage_batch_size: STORAGE_BATCH_SIZE,
            write_lock: Mutex::new(()),
        };
        cache.initialize()?;
        Ok(cache)
    }

    /// Index rows written per metadata transaction
    pub fn with_storage_batch_size(mut self, size: usize) -> Self {
        self.storage_batch_size = size.max(1);
        self
    }

    /// Directory holding the block files
    pub fn blocks_dir(&self) -> &Path {
        &self.blocks_dir
    }

    fn block_path(&self, height: BlockHeight, hash: &[u8]) -> PathBuf {
        self.blocks_dir.join(block_file_name(height, hash))
    }

    fn write_block(&self, block: &CompactBlock) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.blocks_dir)?;
        tmp.write_all(&block.raw)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.block_path(block.height, &block.meta.hash))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Delete files the index does not reference
    fn remove_orphans(&self) -> Result<usize> {
        let indexed: HashMap<BlockHeight, Vec<u8>> = match self.metadata.bounds()? {
            Some((lower, upper)) => self
                .metadata
                .meta_range(BlockRange::new(lower, upper))?
                .into_iter()
                .map(|(height, meta)| (height, meta.hash))
                .collect(),
            None => HashMap::new(),
        };

        let mut removed = 0;
        for entry in self.listing.sorted_entries(&self.blocks_dir)? {
            if indexed.get(&entry.height) != Some(&entry.hash) {
                remove_if_exists(&entry.path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl BlockCache for FsBlockCache {
    fn initialize(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        std::fs::create_dir_all(&self.blocks_dir)?;
        self.metadata.initialize()?;

        let removed = self.remove_orphans()?;
        if removed > 0 {
            tracing::warn!(
                removed,
                dir = %self.blocks_dir.display(),
                "Removed block files missing from the metadata index"
            );
        }
        Ok(())
    }

    fn append(&self, blocks: &[CompactBlock]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        check_append(self.metadata.bounds()?, blocks)?;

        let mut replaced = Vec::new();
        for block in blocks {
            if let Some(old) = self.metadata.hash_at(block.height)? {
                if old != block.meta.hash {
                    replaced.push(self.block_path(block.height, &old));
                }
            }
            self.write_block(block)?;
        }

        for chunk in blocks.chunks(self.storage_batch_size) {
            self.metadata.save(chunk)?;
        }

        for path in replaced {
            remove_if_exists(&path)?;
        }
        Ok(())
    }

    fn latest_height(&self) -> Result<Option<BlockHeight>> {
        Ok(self.metadata.bounds()?.map(|(_, upper)| upper))
    }

    fn earliest_height(&self) -> Result<Option<BlockHeight>> {
        Ok(self.metadata.bounds()?.map(|(lower, _)| lower))
    }

    fn rewind(&self, height: BlockHeight) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.metadata.rewind(height)?;

        for entry in self.listing.sorted_entries(&self.blocks_dir)?.iter().rev() {
            if entry.height <= height {
                break;
            }
            remove_if_exists(&entry.path)?;
        }
        Ok(())
    }

    fn prune(&self, height: BlockHeight) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.metadata.prune(height)?;

        for entry in self.listing.sorted_entries(&self.blocks_dir)? {
            if entry.height > height {
                break;
            }
            remove_if_exists(&entry.path)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        match std::fs::remove_dir_all(&self.blocks_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.metadata.clear()?;
        std::fs::create_dir_all(&self.blocks_dir)?;
        Ok(())
    }

    fn load_range(&self, range: BlockRange) -> Result<Vec<CompactBlock>> {
        let mut blocks = Vec::new();
        for (height, meta) in self.metadata.meta_range(range)? {
            let raw = match std::fs::read(self.block_path(height, &meta.hash)) {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::MissingBlock(height))
                }
                Err(e) => return Err(e.into()),
            };
            blocks.push(CompactBlock { height, raw, meta });
        }
        Ok(blocks)
    }

    fn meta_range(&self, range: BlockRange) -> Result<Vec<(BlockHeight, BlockMeta)>> {
        self.metadata.meta_range(range)
    }
}
