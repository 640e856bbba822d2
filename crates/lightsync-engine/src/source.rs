//! Remote block supplier

use crate::ServiceError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use lightsync_storage::{BlockHeight, BlockRange, CompactBlock};

/// Lazy, finite, non-restartable sequence of blocks in ascending height
pub type BlockStream = BoxStream<'static, Result<CompactBlock, ServiceError>>;

/// Source of chain tip and compact blocks, typically a light wallet server
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Current chain tip
    async fn latest_height(&self) -> Result<BlockHeight, ServiceError>;

    /// Stream every block in `range`, ascending
    async fn stream_blocks(&self, range: BlockRange) -> Result<BlockStream, ServiceError>;
}
