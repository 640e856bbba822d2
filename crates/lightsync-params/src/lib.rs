//! Network parameters and sync defaults
//!
//! This crate provides network-specific constants, the default tuning
//! values used by the sync engine, and checkpoint based birthday
//! resolution.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoints;
pub mod defaults;
pub mod network;

pub use checkpoints::{Checkpoint, CheckpointList};
pub use network::{Network, NetworkType};

/// Error types for parameter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Checkpoint data could not be parsed
    #[error("Invalid checkpoint data: {0}")]
    InvalidCheckpoints(String),

    /// Checkpoint not found
    #[error("No checkpoint found at or below height {0}")]
    CheckpointNotFound(u64),

    /// IO error while reading checkpoint files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
