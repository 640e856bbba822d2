//! Block file naming and sorted directory listing for the filesystem cache.
//!
//! Block files are named `{height}-{hashHex}-compactblock`. Names without
//! the `-compactblock` suffix are ignored; a name with the suffix that does
//! not parse is a [`Error::MalformedCacheEntry`], never skipped, so rewind
//! and prune always account for every block file.

use crate::models::{display_hex, parse_display_hex, BlockHeight};
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Suffix carried by every block file
pub const BLOCK_FILE_SUFFIX: &str = "-compactblock";

/// A parsed block file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFileEntry {
    /// Block height
    pub height: BlockHeight,
    /// Block hash in internal byte order
    pub hash: Vec<u8>,
    /// Full path of the file
    pub path: PathBuf,
}

/// File name for a block
pub fn block_file_name(height: BlockHeight, hash: &[u8]) -> String {
    format!("{}-{}{}", height, display_hex(hash), BLOCK_FILE_SUFFIX)
}

/// Parse a block file name.
///
/// Returns `Ok(None)` for names that are not block files.
pub fn parse_block_file_name(name: &str) -> Result<Option<(BlockHeight, Vec<u8>)>> {
    let Some(stem) = name.strip_suffix(BLOCK_FILE_SUFFIX) else {
        return Ok(None);
    };

    let malformed = || Error::MalformedCacheEntry(name.to_string());
    let (height, hash_hex) = stem.split_once('-').ok_or_else(malformed)?;
    let height: BlockHeight = height.parse().map_err(|_| malformed())?;
    if hash_hex.is_empty() {
        return Err(malformed());
    }
    let hash = parse_display_hex(hash_hex).ok_or_else(malformed)?;

    Ok(Some((height, hash)))
}

/// Lists block files of a directory in ascending height order
pub trait SortedDirectoryListing: Send + Sync {
    /// All block files in `dir`, sorted by height
    fn sorted_entries(&self, dir: &Path) -> Result<Vec<BlockFileEntry>>;
}

/// [`SortedDirectoryListing`] over `std::fs::read_dir`
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDirectoryListing;

impl SortedDirectoryListing for StdDirectoryListing {
    fn sorted_entries(&self, dir: &Path) -> Result<Vec<BlockFileEntry>> {
        let mut entries = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((height, hash)) = parse_block_file_name(name)? {
                entries.push(BlockFileEntry {
                    height,
                    hash,
                    path: entry.path(),
                });
            }
        }

        entries.sort_by(|a, b| a.height.cmp(&b.height).then_with(|| a.hash.cmp(&b.hash)));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_name_roundtrip() {
        let hash = vec![0xaa, 0xbb, 0x01];
        let name = block_file_name(1_000_123, &hash);
        assert_eq!(name, "1000123-01bbaa-compactblock");
        assert_eq!(
            parse_block_file_name(&name).unwrap(),
            Some((1_000_123, hash))
        );
    }

    #[test]
    fn test_unrelated_names_ignored() {
        assert_eq!(parse_block_file_name(".tmpX1y2z3").unwrap(), None);
        assert_eq!(parse_block_file_name("blockmeta.sqlite").unwrap(), None);
        assert_eq!(parse_block_file_name("12-ab-compactblock.bak").unwrap(), None);
    }

    #[test]
    fn test_malformed_names_rejected() {
        for name in [
            "abc-00ff-compactblock",
            "12-zz-compactblock",
            "12--compactblock",
            "12-compactblock",
            "-compactblock",
        ] {
            assert!(
                matches!(parse_block_file_name(name), Err(Error::MalformedCacheEntry(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_listing_sorted_by_height() {
        let dir = tempfile::tempdir().unwrap();
        for height in [30u64, 2, 100, 7] {
            fs::write(dir.path().join(block_file_name(height, &[1, 2])), b"x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let entries = StdDirectoryListing.sorted_entries(dir.path()).unwrap();
        let heights: Vec<_> = entries.iter().map(|e| e.height).collect();
        assert_eq!(heights, vec![2, 7, 30, 100]);
    }

    #[test]
    fn test_listing_surfaces_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(block_file_name(1, &[1])), b"x").unwrap();
        fs::write(dir.path().join("oops-01-compactblock"), b"x").unwrap();

        let err = StdDirectoryListing.sorted_entries(dir.path()).unwrap_err();
        assert!(matches!(err, Error::MalformedCacheEntry(name) if name == "oops-01-compactblock"));
    }
}
