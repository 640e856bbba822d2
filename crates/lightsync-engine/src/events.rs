//! Typed status events and engine states

use lightsync_storage::{BlockHeight, BlockRange};
use std::fmt;

/// Work phases of a sync cycle, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// Fetch blocks into the cache
    Download,
    /// Check hash-chain continuity of cached blocks
    Validate,
    /// Trial-decrypt cached blocks
    Scan,
    /// Fetch full data for wallet transactions
    Enhance,
    /// Fetch transparent UTXOs
    FetchUtxo,
}

impl SyncPhase {
    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Validate => "validate",
            Self::Scan => "scan",
            Self::Enhance => "enhance",
            Self::FetchUtxo => "fetch_utxo",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure categories surfaced to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network/service hiccup, retry may succeed
    Transient,
    /// Local storage cannot be trusted
    Storage,
    /// Inconsistent remote data or cache contents
    Protocol,
    /// Retry ceiling exceeded
    RetriesExhausted,
}

/// Why a cycle failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    /// Category
    pub kind: FailureKind,
    /// Human-readable cause
    pub message: String,
}

impl From<&crate::Error> for SyncFailure {
    fn from(e: &crate::Error) -> Self {
        Self {
            kind: e.failure_kind(),
            message: e.to_string(),
        }
    }
}

/// Engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Created, no cycle run yet
    Unprepared,
    /// Downloading blocks
    Downloading,
    /// Validating the cached chain
    Validating,
    /// Scanning blocks
    Scanning,
    /// Enhancing transactions
    Enhancing,
    /// Fetching UTXOs
    FetchingUtxo,
    /// Rewinding after a reorg
    HandlingReorg,
    /// Idle between cycles; caught up with the last known tip
    Synced,
    /// Stopped by the caller
    Stopped,
    /// Last cycle failed
    Error(SyncFailure),
}

impl From<SyncPhase> for SyncState {
    fn from(phase: SyncPhase) -> Self {
        match phase {
            SyncPhase::Download => Self::Downloading,
            SyncPhase::Validate => Self::Validating,
            SyncPhase::Scan => Self::Scanning,
            SyncPhase::Enhance => Self::Enhancing,
            SyncPhase::FetchUtxo => Self::FetchingUtxo,
        }
    }
}

impl SyncState {
    /// Whether a cycle is executing
    pub fn is_syncing(&self) -> bool {
        matches!(
            self,
            Self::Downloading
                | Self::Validating
                | Self::Scanning
                | Self::Enhancing
                | Self::FetchingUtxo
                | Self::HandlingReorg
        )
    }
}

/// Ordered notifications from the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A phase began work on `range`
    PhaseStarted {
        /// Phase
        phase: SyncPhase,
        /// Range the phase will cover this cycle
        range: BlockRange,
    },
    /// A phase completed work up to `height`
    PhaseProgress {
        /// Phase
        phase: SyncPhase,
        /// Range the phase covers this cycle
        range: BlockRange,
        /// Highest height done
        height: BlockHeight,
        /// Share of `range` done, `0.0..=1.0`
        fraction: f64,
    },
    /// Cycle finished; waiting for the next poll
    Idle {
        /// Remote tip seen by the cycle
        latest_height: BlockHeight,
        /// Scanned cursor after the cycle
        scanned_height: BlockHeight,
    },
    /// Engine stopped
    Stopped,
    /// A reorg was detected and local state rewound
    ReorgHandled {
        /// Height of the stored block that no longer links
        reorg_height: BlockHeight,
        /// Height everything was rewound to
        rewind_height: BlockHeight,
    },
    /// Cycle failed
    Failed(SyncFailure),
}

/// Share of `range` covered once `height` is done
pub fn progress_fraction(range: &BlockRange, height: BlockHeight) -> f64 {
    if height < range.lower {
        return 0.0;
    }
    let done = height.min(range.upper) - range.lower + 1;
    done as f64 / range.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let range = BlockRange::new(1000, 1099);
        assert_eq!(progress_fraction(&range, 999), 0.0);
        assert_eq!(progress_fraction(&range, 1049), 0.5);
        assert_eq!(progress_fraction(&range, 1099), 1.0);
        assert_eq!(progress_fraction(&range, 5000), 1.0);
    }

    #[test]
    fn test_state_from_phase() {
        assert_eq!(SyncState::from(SyncPhase::Scan), SyncState::Scanning);
        assert!(SyncState::from(SyncPhase::FetchUtxo).is_syncing());
        assert!(!SyncState::Synced.is_syncing());
    }
}
