//! Confirmation miner
//!
//! Turns a candidate block into a confirmed one by searching for a nonce.

use crate::core::Block;
use crate::mining::pow;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

/// Miner for confirming candidate blocks
#[derive(Debug, Clone)]
pub struct Miner {
    /// Threads used for the nonce search
    pub workers: usize,
    /// Set to abandon the search in progress
    cancel: Arc<AtomicBool>,
}

impl Miner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop searching as soon as `flag` is set
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Find a nonce for `block` and return it confirmed.
    ///
    /// Returns `None` if no nonce exists for the block's target or the
    /// search was cancelled.
    pub fn mine(&self, block: Block) -> Option<(Block, MiningStats)> {
        let start = Instant::now();

        info!(
            "Mining block {} with {} zero bits...",
            block.short_hash(),
            block.required_zero_bits
        );

        let nonce = match pow::solve_parallel(
            &block.hash,
            block.required_zero_bits,
            self.workers,
            &self.cancel,
        ) {
            Some(nonce) => nonce,
            None => {
                if self.is_cancelled() {
                    info!("Mining of block {} cancelled", block.short_hash());
                }
                return None;
            }
        };

        let elapsed = start.elapsed().as_millis();
        let attempts = nonce.saturating_add(1);
        let hash_rate = if elapsed > 0 {
            (attempts as f64) / (elapsed as f64 / 1000.0)
        } else {
            attempts as f64
        };

        let stats = MiningStats {
            hash_attempts: attempts,
            time_ms: elapsed,
            hash_rate,
        };

        info!(
            "Block {} confirmed in {}ms (nonce {}, {:.2} H/s)",
            block.short_hash(),
            elapsed,
            nonce,
            hash_rate
        );

        Some((block.confirm(nonce), stats))
    }
}

impl Default for Miner {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;
    use crate::crypto::Signer;

    #[test]
    fn test_miner_confirms_block() {
        let signer = Signer::generate();
        let tx = Transaction::leaf("n1", "n2", 3, "").signed(&signer).unwrap();
        let block = Block::new("n1", vec![1u8; 32], tx, 6);

        let (mined, stats) = Miner::new(1).mine(block.clone()).unwrap();

        assert!(mined.confirmed);
        assert!(mined.is_valid_pow());
        assert_eq!(mined.hash, block.hash);
        assert_eq!(stats.hash_attempts, mined.nonce + 1);
    }

    #[test]
    fn test_parallel_miner_agrees() {
        let signer = Signer::generate();
        let tx = Transaction::leaf("n1", "n2", 3, "").signed(&signer).unwrap();
        let block = Block::new("n1", vec![2u8; 32], tx, 8);

        let (a, _) = Miner::new(1).mine(block.clone()).unwrap();
        let (b, _) = Miner::new(3).mine(block).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cancelled_miner_gives_up() {
        let signer = Signer::generate();
        let tx = Transaction::leaf("n1", "n2", 3, "").signed(&signer).unwrap();
        let block = Block::new("n1", vec![3u8; 32], tx, 200);

        let miner = Miner::new(2).with_cancel(Arc::new(AtomicBool::new(true)));
        assert!(miner.is_cancelled());
        assert!(miner.mine(block).is_none());
    }
}
