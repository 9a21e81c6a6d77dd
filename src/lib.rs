//! Minicoin: a minimal peer-to-peer coin node in Rust
//!
//! This crate provides:
//! - Self-referential transactions signed with ECDSA (secp256k1)
//! - A double-SHA-256 hash-chained ledger with an unspent-output pool
//! - Proof-of-work confirmation by peers outside the transfer
//! - WHOIS/IAM identity discovery with deferred delivery
//! - A binary wire codec for every entity and message
//!
//! # Example
//!
//! ```rust
//! use minicoin::config::{GenesisConfig, NodeConfig};
//! use minicoin::network::Cluster;
//!
//! let configs: Vec<NodeConfig> = ["n1", "n2", "n3"]
//!     .iter()
//!     .map(|name| NodeConfig {
//!         required_zero_bits: 4,
//!         genesis: GenesisConfig { beneficiary: "n1".to_string(), stake: 10 },
//!         ..NodeConfig::named(name)
//!     })
//!     .collect();
//!
//! let mut cluster = Cluster::new(&configs).unwrap();
//! cluster.send_coin(0, "n2", 3).unwrap();
//! cluster.run();
//!
//! let n3 = cluster.node("n3").unwrap();
//! assert_eq!(n3.balance("n1"), 7);
//! assert_eq!(n3.balance("n2"), 3);
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod wallet;

// Re-export commonly used types
pub use config::{ConfigError, GenesisConfig, NodeConfig};
pub use core::{Block, Ledger, LedgerError, Transaction, TxId};
pub use crypto::{KeyDirectory, KeyPair, Signer};
pub use mining::{Miner, MiningStats};
pub use network::{Cluster, MemoryNetwork, Node, NodeError, PeerProtocol, TransferState};
pub use wallet::{Wallet, WalletError};
