//! Node configuration
//!
//! Every node of one network must agree on `genesis` and
//! `required_zero_bits`, otherwise their genesis blocks or proof-of-work
//! targets diverge.

use crate::core::{DEFAULT_GENESIS_STAKE, GENESIS, MAX_VALUE};
use crate::crypto::DIGEST_LEN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default proof-of-work target (leading zero bits)
pub const DEFAULT_REQUIRED_ZERO_BITS: u32 = 8;

/// Default ceiling on the target of candidates this node agrees to mine
pub const DEFAULT_MAX_REQUIRED_ZERO_BITS: u32 = 32;

/// Default receive polling interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default capacity of each outbound frame queue
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Who receives the founding stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub beneficiary: String,
    pub stake: u64,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            beneficiary: GENESIS.to_string(),
            stake: DEFAULT_GENESIS_STAKE,
        }
    }
}

/// Configuration of a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name the node answers WHOIS for
    pub name: String,
    /// Proof-of-work target for blocks this node proposes and accepts
    pub required_zero_bits: u32,
    /// Candidates asking for more zero bits than this are not mined
    pub max_required_zero_bits: u32,
    pub genesis: GenesisConfig,
    /// Receive timeout between shutdown-flag checks
    pub poll_interval_ms: u64,
    /// Threads used when mining a confirmation
    pub mining_workers: usize,
    pub outbound_queue_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            required_zero_bits: DEFAULT_REQUIRED_ZERO_BITS,
            max_required_zero_bits: DEFAULT_MAX_REQUIRED_ZERO_BITS,
            genesis: GenesisConfig::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            mining_workers: 1,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl NodeConfig {
    /// Defaults for a node called `name`
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if self.genesis.stake == 0 || self.genesis.stake > MAX_VALUE {
            return Err(ConfigError::Invalid(format!(
                "genesis stake must be between 1 and {}",
                MAX_VALUE
            )));
        }
        let digest_bits = (DIGEST_LEN * 8) as u32;
        if self.max_required_zero_bits > digest_bits {
            return Err(ConfigError::Invalid(format!(
                "max_required_zero_bits must not exceed {}",
                digest_bits
            )));
        }
        if self.required_zero_bits > self.max_required_zero_bits {
            return Err(ConfigError::Invalid(
                "required_zero_bits exceeds max_required_zero_bits".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
