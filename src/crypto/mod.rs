//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 / double SHA-256 hashing and leading-zero targets
//! - ECDSA identities (secp256k1): signing capability and key directory

pub mod hash;
pub mod keys;

pub use hash::{
    double_sha256, double_sha256_parts, leading_zero_bits, meets_difficulty, sha256, DIGEST_LEN,
};
pub use keys::{
    public_key_from_bytes, verify_signature, KeyDirectory, KeyError, KeyPair, Signer, NO_ONE,
};
