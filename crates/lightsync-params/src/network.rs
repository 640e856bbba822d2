//! Network definitions

use crate::defaults::{DEFAULT_REWIND_DISTANCE, MAX_REORG_SIZE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Network type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Mainnet
    Mainnet,
    /// Testnet
    Testnet,
    /// Regtest (local development)
    Regtest,
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone)]
pub struct Network {
    /// Network type
    pub network_type: NetworkType,
    /// Human-readable name
    pub name: &'static str,
    /// Height at which shielded outputs first appear; nothing below it is scanned
    pub sapling_activation_height: u64,
    /// Rewind distance used when a reorg is detected
    pub rewind_distance: u64,
    /// Deepest reorg the network is expected to produce
    pub max_reorg_size: u64,
}

impl Network {
    /// Get mainnet parameters
    pub const fn mainnet() -> Self {
        Self {
            network_type: NetworkType::Mainnet,
            name: "mainnet",
            sapling_activation_height: 419_200,
            rewind_distance: DEFAULT_REWIND_DISTANCE,
            max_reorg_size: MAX_REORG_SIZE,
        }
    }

    /// Get testnet parameters
    pub const fn testnet() -> Self {
        Self {
            network_type: NetworkType::Testnet,
            name: "testnet",
            sapling_activation_height: 280_000,
            rewind_distance: DEFAULT_REWIND_DISTANCE,
            max_reorg_size: MAX_REORG_SIZE,
        }
    }

    /// Get regtest parameters
    pub const fn regtest() -> Self {
        Self {
            network_type: NetworkType::Regtest,
            name: "regtest",
            sapling_activation_height: 1,
            rewind_distance: 3,
            max_reorg_size: 20,
        }
    }

    /// Get network by type
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Clamp a requested wallet birthday to the first scannable height.
    pub const fn clamp_birthday(&self, height: u64) -> u64 {
        if height < self.sapling_activation_height {
            self.sapling_activation_height
        } else {
            height
        }
    }
}
