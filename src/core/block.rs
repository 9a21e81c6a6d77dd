//! Block implementation
//!
//! A block carries exactly one transaction and links to its predecessor
//! through `hash = double_sha256(prev_hash ‖ encode(transaction))`. It stays
//! a candidate until a peer finds a nonce for `required_zero_bits` and
//! marks it confirmed.

use crate::codec::{CodecError, Decode, Encode, WireReader, WireWriter};
use crate::core::transaction::Transaction;
use crate::crypto::double_sha256_parts;
use crate::mining::pow;

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Block {
    /// Name of the peer that proposed the block
    pub proposer: String,
    /// Hash of the previous block (empty for genesis)
    pub prev_hash: Vec<u8>,
    /// Chain hash of this block
    pub hash: Vec<u8>,
    /// The transfer recorded by this block
    pub transaction: Transaction,
    /// Whether a proof-of-work nonce has been attached
    pub confirmed: bool,
    /// Proof-of-work nonce (meaningful once confirmed)
    pub nonce: u64,
    /// Leading zero bits the proof-of-work must reach
    pub required_zero_bits: u32,
}

impl Block {
    /// Create an unconfirmed block chained onto `prev_hash`
    pub fn new(
        proposer: &str,
        prev_hash: Vec<u8>,
        transaction: Transaction,
        required_zero_bits: u32,
    ) -> Self {
        let hash = Self::compute_hash(&prev_hash, &transaction);
        Self {
            proposer: proposer.to_string(),
            prev_hash,
            hash,
            transaction,
            confirmed: false,
            nonce: 0,
            required_zero_bits,
        }
    }

    /// Chain hash for `transaction` appended after `prev_hash`
    pub fn compute_hash(prev_hash: &[u8], transaction: &Transaction) -> Vec<u8> {
        double_sha256_parts(&[prev_hash, &transaction.to_bytes()])
    }

    /// Verify the block hash against its own `prev_hash` and transaction
    pub fn verify_hash(&self) -> bool {
        self.hash == Self::compute_hash(&self.prev_hash, &self.transaction)
    }

    /// Whether the block is confirmed with a nonce meeting its target
    pub fn is_valid_pow(&self) -> bool {
        self.confirmed && pow::check(&self.hash, self.nonce, self.required_zero_bits)
    }

    /// Attach a proof-of-work nonce
    pub fn confirm(mut self, nonce: u64) -> Self {
        self.confirmed = true;
        self.nonce = nonce;
        self
    }

    /// Same block with the confirmation stripped
    pub fn unconfirmed(mut self) -> Self {
        self.confirmed = false;
        self.nonce = 0;
        self
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// First 16 hex digits of the hash, for logs
    pub fn short_hash(&self) -> String {
        let hex = self.hash_hex();
        hex.chars().take(16).collect()
    }
}

impl Encode for Block {
    fn encode(&self, writer: &mut WireWriter) {
        writer.put_str(&self.proposer);
        writer.put_bytes(&self.prev_hash);
        writer.put_bytes(&self.hash);
        writer.put_encoded(&self.transaction);
        writer.put_bool(self.confirmed);
        writer.put_u64(self.nonce);
        writer.put_u32(self.required_zero_bits);
    }
}

impl Decode for Block {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            proposer: reader.get_string()?,
            prev_hash: reader.get_bytes()?,
            hash: reader.get_bytes()?,
            transaction: reader.get_decoded()?,
            confirmed: reader.get_bool()?,
            nonce: reader.get_u64()?,
            required_zero_bits: reader.get_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Signer;

    fn sample_block(zero_bits: u32) -> Block {
        let signer = Signer::generate();
        let tx = Transaction::leaf("n1", "n2", 3, "").signed(&signer).unwrap();
        Block::new("n1", vec![7u8; 32], tx, zero_bits)
    }

    #[test]
    fn test_new_block_is_unconfirmed() {
        let block = sample_block(4);
        assert!(!block.confirmed);
        assert!(block.verify_hash());
        assert!(!block.is_valid_pow());
    }

    #[test]
    fn test_confirmed_round_trip() {
        let block = sample_block(4);
        let nonce = pow::solve(&block.hash, 4).unwrap();
        let block = block.confirm(nonce);
        assert!(block.is_valid_pow());

        let decoded = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_tampered_transaction_breaks_hash() {
        let mut block = sample_block(0);
        block.transaction.value = 30;
        assert!(!block.verify_hash());
    }

    #[test]
    fn test_nonce_is_part_of_identity() {
        let block = sample_block(0);
        let a = block.clone().confirm(1);
        let b = block.confirm(2);
        assert_ne!(a, b);
        assert_eq!(a.clone().unconfirmed(), b.unconfirmed());
    }

    #[test]
    fn test_truncated_block_rejected() {
        let bytes = sample_block(0).to_bytes();
        assert!(matches!(
            Block::from_bytes(&bytes[..bytes.len() - 3]),
            Err(CodecError::MalformedMessage(_))
        ));
    }
}
