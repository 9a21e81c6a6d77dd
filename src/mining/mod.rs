//! Proof-of-work search and verification

pub mod miner;
pub mod pow;

pub use miner::{Miner, MiningStats};
pub use pow::{check, is_reachable, solve, solve_parallel, solve_until, work_hash};
