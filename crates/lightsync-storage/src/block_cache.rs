//! Block cache capability shared by the table and filesystem backends

use crate::models::{BlockHeight, BlockMeta, BlockRange, CompactBlock, MAX_STORED_HEIGHT};
use crate::{Error, Result};

/// Persistent store of downloaded compact blocks keyed by height.
///
/// Stored heights always form one contiguous range (or nothing). The sync
/// engine is the only writer; implementations serialize their own access.
pub trait BlockCache: Send + Sync {
    /// Create backing tables/directories if missing and recover from an
    /// interrupted write.
    fn initialize(&self) -> Result<()>;

    /// Store an ordered run of consecutive blocks. Re-appending a stored
    /// height overwrites it. Fails without writing when the run would leave
    /// a gap next to the stored range.
    fn append(&self, blocks: &[CompactBlock]) -> Result<()>;

    /// Highest stored height, `None` when empty
    fn latest_height(&self) -> Result<Option<BlockHeight>>;

    /// Lowest stored height, `None` when empty
    fn earliest_height(&self) -> Result<Option<BlockHeight>>;

    /// Delete every block above `height`
    fn rewind(&self, height: BlockHeight) -> Result<()>;

    /// Delete every block at or below `height`
    fn prune(&self, height: BlockHeight) -> Result<()>;

    /// Remove everything and reinitialize
    fn clear(&self) -> Result<()>;

    /// Stored blocks within `range`, ascending
    fn load_range(&self, range: BlockRange) -> Result<Vec<CompactBlock>>;

    /// Stored metadata within `range`, ascending
    fn meta_range(&self, range: BlockRange) -> Result<Vec<(BlockHeight, BlockMeta)>>;
}

/// Reject batches that are out of order or would open a gap against the
/// stored `[lower, upper]` bounds.
pub(crate) fn check_append(
    bounds: Option<(BlockHeight, BlockHeight)>,
    blocks: &[CompactBlock],
) -> Result<()> {
    for pair in blocks.windows(2) {
        if pair[1].height != pair[0].height + 1 {
            return Err(Error::UnorderedBatch {
                previous: pair[0].height,
                found: pair[1].height,
            });
        }
    }

    let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
        return Ok(());
    };

    if last.height > MAX_STORED_HEIGHT {
        return Err(Error::HeightOutOfRange(last.height));
    }

    if let Some((lower, upper)) = bounds {
        let touches_above = first.height <= upper.saturating_add(1);
        let touches_below = last.height.saturating_add(1) >= lower;
        if !(touches_above && touches_below) {
            return Err(Error::NonContiguous {
                lower,
                upper,
                first: first.height,
            });
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_check_append_empty_cache() {
        assert!(check_append(None, &blocks(10, 20)).is_ok());
        assert!(check_append(None, &[]).is_ok());
    }

    #[test]
    fn test_check_append_adjacent_and_overlap() {
        let bounds = Some((10, 20));
        assert!(check_append(bounds, &blocks(21, 25)).is_ok());
        assert!(check_append(bounds, &blocks(15, 25)).is_ok());
        assert!(check_append(bounds, &blocks(5, 9)).is_ok());
        assert!(check_append(bounds, &blocks(12, 13)).is_ok());
    }

    #[test]
    fn test_check_append_gap() {
        let err = check_append(Some((10, 20)), &blocks(22, 25)).unwrap_err();
        assert!(matches!(err, Error::NonContiguous { first: 22, .. }));

        let err = check_append(Some((10, 20)), &blocks(3, 8)).unwrap_err();
        assert!(matches!(err, Error::NonContiguous { first: 3, .. }));
    }

    #[test]
    fn test_check_append_height_out_of_range() {
        let batch = vec![block(MAX_STORED_HEIGHT + 1, 0)];
        assert!(matches!(
            check_append(None, &batch),
            Err(Error::HeightOutOfRange(_))
        ));
    }

    #[test]
    fn test_check_append_unordered() {
        let batch = vec![block(5, 0), block(7, 0)];
        assert!(matches!(
            check_append(None, &batch),
            Err(Error::UnorderedBatch { previous: 5, found: 7 })
        ));
    }
}
