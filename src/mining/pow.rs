//! Proof-of-work
//!
//! A nonce is valid for a digest when `double_sha256(digest ‖ nonce_be)`
//! starts with at least `required_zero_bits` zero bits.

use crate::crypto::{double_sha256_parts, meets_difficulty, DIGEST_LEN};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// Nonces scanned between cancellation checks
const PARALLEL_CHUNK: u64 = 1 << 16;

/// The hash a nonce is judged by
pub fn work_hash(digest: &[u8], nonce: u64) -> Vec<u8> {
    double_sha256_parts(&[digest, &nonce.to_be_bytes()])
}

/// Check a nonce against the target; one hash evaluation.
pub fn check(digest: &[u8], nonce: u64, required_zero_bits: u32) -> bool {
    meets_difficulty(&work_hash(digest, nonce), required_zero_bits)
}

/// Whether any hash could meet the target at all
pub fn is_reachable(required_zero_bits: u32) -> bool {
    required_zero_bits as usize <= DIGEST_LEN * 8
}

/// Find the smallest satisfying nonce, scanning sequentially from 0.
///
/// Returns `None` for targets wider than the hash, or if the whole nonce
/// space is exhausted.
pub fn solve(digest: &[u8], required_zero_bits: u32) -> Option<u64> {
    solve_until(digest, required_zero_bits, &AtomicBool::new(false))
}

/// Like [`solve`], giving up with `None` once `cancel` is set.
pub fn solve_until(digest: &[u8], required_zero_bits: u32, cancel: &AtomicBool) -> Option<u64> {
    if !is_reachable(required_zero_bits) {
        return None;
    }
    scan(cancel, |start, end| {
        (start..=end).find(|nonce| check(digest, *nonce, required_zero_bits))
    })
}

/// Like [`solve_until`], sharded across the rayon pool.
///
/// Chunks are scanned in order and `find_first` keeps the lowest hit in a
/// chunk, so the result is still the smallest satisfying nonce.
pub fn solve_parallel(
    digest: &[u8],
    required_zero_bits: u32,
    workers: usize,
    cancel: &AtomicBool,
) -> Option<u64> {
    if workers <= 1 || !is_reachable(required_zero_bits) {
        return solve_until(digest, required_zero_bits, cancel);
    }
    let pool = match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool,
        Err(e) => {
            log::warn!("Falling back to sequential solve: {}", e);
            return solve_until(digest, required_zero_bits, cancel);
        }
    };

    pool.install(|| {
        scan(cancel, |start, end| {
            (start..=end)
                .into_par_iter()
                .find_first(|nonce| check(digest, *nonce, required_zero_bits))
        })
    })
}

/// Walk the nonce space in inclusive chunks, checking `cancel` before each
fn scan<F>(cancel: &AtomicBool, search: F) -> Option<u64>
where
    F: Fn(u64, u64) -> Option<u64>,
{
    let mut start = 0u64;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        let end = start.saturating_add(PARALLEL_CHUNK - 1);
        if let Some(nonce) = search(start, end) {
            return Some(nonce);
        }
        if end == u64::MAX {
            return None;
        }
        start = end + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{double_sha256, leading_zero_bits};

    #[test]
    fn test_zero_bits_is_nonce_zero() {
        assert_eq!(solve(b"anything", 0), Some(0));
        assert!(check(b"anything", 12345, 0));
    }

    #[test]
    fn test_solve_then_check() {
        for zero_bits in 0..=12 {
            let digest = double_sha256(format!("block-{}", zero_bits).as_bytes());
            let nonce = solve(&digest, zero_bits).unwrap();
            assert!(check(&digest, nonce, zero_bits), "z={}", zero_bits);
        }
    }

    #[test]
    fn test_solution_is_smallest() {
        let digest = double_sha256(b"smallest");
        let nonce = solve(&digest, 8).unwrap();
        assert!((0..nonce).all(|n| !check(&digest, n, 8)));
        if nonce > 0 {
            assert!(!check(&digest, nonce - 1, 8));
        }
    }

    #[test]
    fn test_check_fails_just_past_achieved_bits() {
        let digest = double_sha256(b"negative");
        let nonce = solve(&digest, 6).unwrap();
        let achieved = leading_zero_bits(&work_hash(&digest, nonce));
        assert!(achieved >= 6);
        assert!(check(&digest, nonce, achieved));
        assert!(!check(&digest, nonce, achieved + 1));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let digest = double_sha256(b"parallel");
        let running = AtomicBool::new(false);
        assert_eq!(solve_parallel(&digest, 10, 4, &running), solve(&digest, 10));
        assert_eq!(solve_parallel(&digest, 10, 1, &running), solve(&digest, 10));
    }

    #[test]
    fn test_target_wider_than_hash_is_unreachable() {
        assert!(is_reachable(256));
        assert!(!is_reachable(257));
        assert_eq!(solve(&[7u8; 32], 300), None);
        assert_eq!(solve_parallel(&[7u8; 32], 300, 4, &AtomicBool::new(false)), None);
    }

    #[test]
    fn test_cancelled_search_returns_none() {
        let cancelled = AtomicBool::new(true);
        assert_eq!(solve_until(&[7u8; 32], 200, &cancelled), None);
        assert_eq!(solve_parallel(&[7u8; 32], 200, 2, &cancelled), None);
    }

    #[test]
    fn test_cancel_stops_running_search() {
        use std::sync::Arc;
        use std::time::Duration;

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            done_tx.send(solve_until(&[7u8; 32], 200, &flag)).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        cancel.store(true, Ordering::SeqCst);
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(None));
    }
}
