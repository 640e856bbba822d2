//! Wallet birthday checkpoints
//!
//! A checkpoint anchors a height with the chain state needed to start
//! scanning there. Lists are loaded from JSON so they can ship next to
//! the binary and be refreshed without a release.

use crate::{Error, Network, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A blockchain checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Block height
    pub height: u64,
    /// Block hash (hex)
    pub hash: String,
    /// Timestamp (Unix epoch)
    pub time: u64,
    /// Serialized commitment tree state at this height (hex)
    #[serde(default)]
    pub tree: String,
}

/// List of checkpoints, sorted by height
#[derive(Debug, Clone, Default)]
pub struct CheckpointList {
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointList {
    /// Create a new checkpoint list
    pub fn new(mut checkpoints: Vec<Checkpoint>) -> Self {
        checkpoints.sort_by_key(|c| c.height);
        checkpoints.dedup_by_key(|c| c.height);
        Self { checkpoints }
    }

    /// Parse a JSON array of checkpoints
    pub fn from_json_str(json: &str) -> Result<Self> {
        let checkpoints: Vec<Checkpoint> =
            serde_json::from_str(json).map_err(|e| Error::InvalidCheckpoints(e.to_string()))?;
        Ok(Self::new(checkpoints))
    }

    /// Load a JSON checkpoint file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Number of checkpoints
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Nearest checkpoint at or below `height`
    pub fn nearest_at_or_below(&self, height: u64) -> Option<&Checkpoint> {
        let idx = self.checkpoints.partition_point(|c| c.height <= height);
        idx.checked_sub(1).map(|i| &self.checkpoints[i])
    }

    /// Resolve the height a wallet with the given birthday starts scanning at.
    ///
    /// The request is first clamped to the network's activation height; if a
    /// checkpoint exists at or below it, scanning starts at that checkpoint.
    pub fn birthday_height(&self, network: &Network, requested: u64) -> u64 {
        let clamped = network.clamp_birthday(requested);
        self.nearest_at_or_below(clamped)
            .map(|c| network.clamp_birthday(c.height))
            .unwrap_or(clamped)
    }

    /// Nearest checkpoint at or below `height`, or an error when none exists.
    pub fn require_checkpoint(&self, height: u64) -> Result<&Checkpoint> {
        self.nearest_at_or_below(height)
            .ok_or(Error::CheckpointNotFound(height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> CheckpointList {
        CheckpointList::new(vec![
            Checkpoint {
                height: 1_500_000,
                hash: "bb".into(),
                time: 2,
                tree: String::new(),
            },
            Checkpoint {
                height: 1_000_000,
                hash: "aa".into(),
                time: 1,
                tree: String::new(),
            },
        ])
    }

    #[test]
    fn test_nearest_checkpoint() {
        let list = sample();
        assert_eq!(list.nearest_at_or_below(1_200_000).unwrap().height, 1_000_000);
        assert_eq!(list.nearest_at_or_below(1_500_000).unwrap().height, 1_500_000);
        assert!(list.nearest_at_or_below(999_999).is_none());
    }

    #[test]
    fn test_birthday_height() {
        let list = sample();
        let net = Network::mainnet();
        assert_eq!(list.birthday_height(&net, 1_600_000), 1_500_000);
        // No checkpoint below the request: fall back to the clamped request
        assert_eq!(list.birthday_height(&net, 500_000), 500_000);
        assert_eq!(list.birthday_height(&net, 10), 419_200);
    }

    #[test]
    fn test_require_checkpoint() {
        let list = sample();
        assert!(matches!(
            list.require_checkpoint(5),
            Err(Error::CheckpointNotFound(5))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"height": 10, "hash": "00", "time": 0}}, {{"height": 5, "hash": "01", "time": 0}}]"#
        )
        .unwrap();

        let list = CheckpointList::from_file(file.path()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.nearest_at_or_below(7).unwrap().height, 5);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            CheckpointList::from_json_str("{"),
            Err(Error::InvalidCheckpoints(_))
        ));
    }
}
