//! Engine configuration

use crate::{Error, Result};
use lightsync_params::defaults::*;
use lightsync_params::{CheckpointList, Network};
use lightsync_storage::BlockHeight;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lowest height a reorg rewind may reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewindFloor {
    /// Never below the wallet birthday
    Birthday,
    /// Up to `depth` blocks below the wallet birthday
    BelowBirthday {
        /// Blocks allowed below the birthday
        depth: u64,
    },
}

/// How far to rewind when validation finds a reorg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindPolicy {
    /// Blocks rewound below the reorg height
    pub distance: u64,
    /// Grow the distance with each consecutive reorg
    pub escalate: bool,
    /// Cap for the escalated distance
    pub max_depth: u64,
    /// Lowest height a rewind may reach
    pub floor: RewindFloor,
}

impl Default for RewindPolicy {
    fn default() -> Self {
        Self {
            distance: DEFAULT_REWIND_DISTANCE,
            escalate: false,
            max_depth: MAX_REORG_SIZE,
            floor: RewindFloor::Birthday,
        }
    }
}

impl RewindPolicy {
    /// Height to rewind to for a reorg at `reorg_height`.
    ///
    /// `consecutive` counts reorgs already handled earlier in the same
    /// cycle.
    pub fn rewind_height(
        &self,
        reorg_height: BlockHeight,
        consecutive: u32,
        birthday: BlockHeight,
    ) -> BlockHeight {
        let offset = if self.escalate {
            self.distance
                .saturating_mul(u64::from(consecutive) + 1)
                .min(self.max_depth)
        } else {
            self.distance
        };

        let floor = match self.floor {
            RewindFloor::Birthday => birthday,
            RewindFloor::BelowBirthday { depth } => birthday.saturating_sub(depth),
        };

        reorg_height
            .saturating_sub(offset)
            .max(floor)
            .min(reorg_height)
    }
}

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// First height the wallet cares about
    pub birthday: BlockHeight,
    /// Reorg rewind policy
    pub rewind_policy: RewindPolicy,
    /// Blocks per download/scan batch
    pub batch_size: u64,
    /// Blocks buffered before a cache flush
    pub download_buffer_size: usize,
    /// A stream is replaced after delivering this many batches worth of blocks
    pub stream_batch_multiplier: u64,
    /// Blocks per enhancement call
    pub enhance_batch_size: u64,
    /// Interval between cycles
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Randomize the poll interval in `[0.5x, 1.5x)`
    pub poll_jitter: bool,
    /// Retry ceiling for transient failures within one cycle
    pub retries: u32,
    /// First retry delay
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    /// Upper bound for the retry delay
    #[serde(rename = "max_backoff_interval_ms", with = "millis")]
    pub max_backoff_interval: Duration,
    /// Scanned blocks kept in the cache; `None` keeps everything
    pub retained_scanned_blocks: Option<u64>,
    /// Reorgs tolerated in a row before the cycle fails
    pub max_consecutive_reorgs: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            birthday: 0,
            rewind_policy: RewindPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            download_buffer_size: DEFAULT_DOWNLOAD_BUFFER_SIZE,
            stream_batch_multiplier: DEFAULT_STREAM_BATCH_MULTIPLIER,
            enhance_batch_size: DEFAULT_ENHANCE_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_jitter: true,
            retries: DEFAULT_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff_interval: DEFAULT_MAX_BACKOFF_INTERVAL,
            retained_scanned_blocks: Some(DEFAULT_RETAINED_SCANNED_BLOCKS),
            max_consecutive_reorgs: DEFAULT_MAX_CONSECUTIVE_REORGS,
        }
    }
}

impl SyncConfig {
    /// Defaults for `network`, with the birthday resolved against `checkpoints`
    pub fn for_network(network: &Network, checkpoints: &CheckpointList, birthday: u64) -> Self {
        Self {
            birthday: checkpoints.birthday_height(network, birthday),
            rewind_policy: RewindPolicy {
                distance: network.rewind_distance,
                max_depth: network.max_reorg_size,
                ..RewindPolicy::default()
            },
            ..Self::default()
        }
    }

    /// Parse JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Set the wallet birthday
    pub fn with_birthday(mut self, birthday: BlockHeight) -> Self {
        self.birthday = birthday;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the fixed rewind distance
    pub fn with_rewind_distance(mut self, distance: u64) -> Self {
        self.rewind_policy.distance = distance;
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.download_buffer_size == 0 {
            return Err(Error::Config("download_buffer_size must be positive".into()));
        }
        if self.stream_batch_multiplier == 0 {
            return Err(Error::Config("stream_batch_multiplier must be positive".into()));
        }
        if self.enhance_batch_size == 0 {
            return Err(Error::Config("enhance_batch_size must be positive".into()));
        }
        if self.rewind_policy.distance >= self.rewind_policy.max_depth {
            return Err(Error::Config(format!(
                "rewind distance {} must stay below max reorg depth {}",
                self.rewind_policy.distance, self.rewind_policy.max_depth
            )));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
