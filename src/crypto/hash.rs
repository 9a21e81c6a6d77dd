//! Hashing primitives
//!
//! Every digest in the ledger and in proof-of-work is a double SHA-256.

use sha2::{Digest, Sha256};

/// Length in bytes of every digest produced here
pub const DIGEST_LEN: usize = 32;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> Vec<u8> {
    sha256(&sha256(data))
}

/// Double SHA-256 over the concatenation of several byte slices
///
/// Equivalent to `double_sha256(&[a, b, ..].concat())` without building
/// the intermediate buffer.
pub fn double_sha256_parts(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    sha256(&hasher.finalize())
}

/// Checks whether `hash` starts with at least `zero_bits` zero bits.
///
/// A target wider than the hash requires every bit of the hash to be zero.
pub fn meets_difficulty(hash: &[u8], zero_bits: u32) -> bool {
    let full_bytes = zero_bits as usize / 8;
    let remaining_bits = zero_bits as usize % 8;

    if hash.iter().take(full_bytes).any(|byte| *byte != 0) {
        return false;
    }

    if remaining_bits > 0 && full_bytes < hash.len() {
        let mask = 0xFFu8 << (8 - remaining_bits);
        if hash[full_bytes] & mask != 0 {
            return false;
        }
    }

    true
}

/// Number of leading zero bits in a hash
pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}
