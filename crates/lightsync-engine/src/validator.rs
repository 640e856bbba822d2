//! Hash-chain continuity check over cached blocks

use crate::{Error, Result};
use lightsync_storage::{BlockCache, BlockRange};

/// Check that every cached block in `range` links to its predecessor.
///
/// The block below `range.lower` is used as the anchor when it is cached;
/// without it the first block is accepted as is. A break surfaces as
/// [`Error::InvalidChain`] at the height of the block that is no longer
/// linked to, which is where the reorg happened.
pub fn validate_chain(cache: &dyn BlockCache, range: BlockRange) -> Result<()> {
    let lower = range.lower.saturating_sub(1);
    let metas = cache.meta_range(BlockRange::new(lower, range.upper))?;
    if metas.first().map_or(true, |(first, _)| *first > range.lower) {
        return Err(Error::Protocol(format!(
            "blocks missing from cache for {}",
            range
        )));
    }

    let mut previous = None;
    let mut expected = None;
    for (height, meta) in metas {
        if let Some(next) = expected {
            if height != next {
                return Err(Error::Protocol(format!(
                    "cache gap: expected block {}, found {}",
                    next, height
                )));
            }
        }

        if let Some((prev_height, prev_hash)) = previous.take() {
            if meta.prev_hash != prev_hash {
                tracing::warn!(
                    event = "chain_discontinuity",
                    height = prev_height,
                    stored_hash = %hex::encode(&prev_hash),
                    declared_prev_hash = %hex::encode(&meta.prev_hash),
                    "Cached block does not link to its predecessor"
                );
                return Err(Error::InvalidChain {
                    height: prev_height,
                });
            }
        }

        expected = Some(height + 1);
        previous = Some((height, meta.hash));
    }

    match expected {
        Some(next) if next > range.upper => Ok(()),
        _ => Err(Error::Protocol(format!(
            "blocks missing from cache for {}",
            range
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightsync_storage::{BlockMeta, CompactBlock, SqliteBlockCache};

    fn block(height: u64, fork: u8, prev_fork: u8) -> CompactBlock {
        CompactBlock {
            height,
            raw: Vec::new(),
            meta: BlockMeta {
                hash: vec![fork, height as u8],
                prev_hash: vec![prev_fork, height.wrapping_sub(1) as u8],
                time: 0,
                sapling_outputs: 0,
                orchard_actions: 0,
            },
        }
    }

    fn cache_with(blocks: &[CompactBlock]) -> SqliteBlockCache {
        let cache = SqliteBlockCache::open_in_memory().unwrap();
        cache.append(blocks).unwrap();
        cache
    }

    #[test]
    fn test_linked_chain_validates() {
        let blocks: Vec<_> = (10..20).map(|h| block(h, 0, 0)).collect();
        let cache = cache_with(&blocks);
        assert!(validate_chain(&cache, BlockRange::new(15, 19)).is_ok());
        // No anchor below the first cached block
        assert!(validate_chain(&cache, BlockRange::new(10, 19)).is_ok());
    }

    #[test]
    fn test_mismatch_reports_prior_height() {
        let mut blocks: Vec<_> = (10..=14).map(|h| block(h, 0, 0)).collect();
        // Block 15 comes from another fork and does not link to stored 14
        blocks.push(block(15, 1, 1));
        let cache = cache_with(&blocks);

        let err = validate_chain(&cache, BlockRange::new(15, 15)).unwrap_err();
        assert!(matches!(err, Error::InvalidChain { height: 14 }));
    }

    #[test]
    fn test_missing_blocks_are_protocol_errors() {
        let blocks: Vec<_> = (10..15).map(|h| block(h, 0, 0)).collect();
        let cache = cache_with(&blocks);
        assert!(matches!(
            validate_chain(&cache, BlockRange::new(12, 20)),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            validate_chain(&cache, BlockRange::new(5, 12)),
            Err(Error::Protocol(_))
        ));
    }
}
