//! Compact block sync engine for light wallets
//!
//! Downloads compact blocks from a remote source into a local cache,
//! validates hash linkage, drives wallet scanning and follow-up phases,
//! and recovers from reorgs, interruptions and transient remote failures.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod cancel;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod event_logger;
pub mod events;
pub mod hooks;
pub mod logging;
pub mod metrics;
pub mod progress;
pub mod retry;
pub mod simulation;
pub mod source;
pub mod validator;
pub mod wallet;

pub use cancel::CancelToken;
pub use config::{RewindFloor, RewindPolicy, SyncConfig};
pub use downloader::BlockDownloader;
pub use engine::{CycleOutcome, SyncDependencies, SyncEngine};
pub use error::{Error, Result, ServiceError};
pub use event_logger::{LoggedEvent, SyncEventLogger};
pub use events::{FailureKind, SyncEvent, SyncFailure, SyncPhase, SyncState};
pub use hooks::{DeferredActionQueue, DeferredHook, HookKind};
pub use logging::init_logging;
pub use metrics::{PerfCounters, PerfSnapshot};
pub use progress::{NextState, SyncProgress, SyncProgressTracker, SyncRanges};
pub use simulation::{RecordingScanner, SimulatedChain};
pub use source::{BlockSource, BlockStream};
pub use validator::validate_chain;
pub use wallet::{
    EnhanceSummary, NoteScanner, ScanSummary, TransactionEnhancer, UtxoFetcher, UtxoSummary,
};

pub use lightsync_storage::{BlockCache, BlockHeight, BlockRange, CompactBlock, ProgressKey};
