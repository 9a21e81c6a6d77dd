//! Node identity: key pairs, the signing capability and the peer key directory
//!
//! Signatures are ECDSA over secp256k1 (RFC 6979 deterministic nonces),
//! computed on the SHA-256 digest of the signed bytes.

use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use super::hash::sha256;

/// Sentinel identity that founds the ledger
pub const NO_ONE: &str = "NO_ONE";

/// Well-known secret of the sentinel identity. Every node derives the same
/// key pair from it, so the genesis transaction verifies without a handshake.
const NO_ONE_SECRET: [u8; 32] = [0x11; 32];

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// The sentinel key pair shared by every node
    pub fn no_one() -> Result<Self, KeyError> {
        let secret_key =
            SecretKey::from_slice(&NO_ONE_SECRET).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }
}

/// Parse a compressed or uncompressed public key
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    PublicKey::from_slice(bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Verify `signature` over `data` against `public_key`.
///
/// Malformed signatures verify as `false`.
pub fn verify_signature(public_key: &PublicKey, signature: &[u8], data: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(message) = Message::from_digest_slice(&sha256(data)) else {
        return false;
    };
    match Signature::from_compact(signature) {
        Ok(sig) => secp.verify_ecdsa(&message, &sig, public_key).is_ok(),
        Err(_) => false,
    }
}

struct SigningContext {
    secp: Secp256k1<All>,
    secret_key: SecretKey,
}

/// The node's signing capability.
///
/// The context sits behind a lock so at most one sign or verify is in
/// flight per node. The private half never leaves this type.
pub struct Signer {
    public_key: PublicKey,
    context: Mutex<SigningContext>,
}

impl Signer {
    pub fn new(key_pair: KeyPair) -> Self {
        Self {
            public_key: key_pair.public_key,
            context: Mutex::new(SigningContext {
                secp: Secp256k1::new(),
                secret_key: key_pair.secret_key,
            }),
        }
    }

    /// Signer over a freshly generated key pair
    pub fn generate() -> Self {
        Self::new(KeyPair::generate())
    }

    /// Signer for the sentinel identity
    pub fn no_one() -> Result<Self, KeyError> {
        Ok(Self::new(KeyPair::no_one()?))
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Compressed public key bytes, as announced in IAM
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// Sign `data` with the local private key (compact 64-byte signature)
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let message = Message::from_digest_slice(&sha256(data))?;
        let context = self
            .context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let signature = context.secp.sign_ecdsa(&message, &context.secret_key);
        Ok(signature.serialize_compact().to_vec())
    }

    /// Verify a remote signature through the same serialized context
    pub fn verify(&self, public_key: &PublicKey, signature: &[u8], data: &[u8]) -> bool {
        let Ok(message) = Message::from_digest_slice(&sha256(data)) else {
            return false;
        };
        let Ok(sig) = Signature::from_compact(signature) else {
            return false;
        };
        let context = self
            .context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        context.secp.verify_ecdsa(&message, &sig, public_key).is_ok()
    }
}

/// Directory of known peer public keys, keyed by peer name.
///
/// A missing entry is a normal state: the caller asks the network (WHOIS)
/// and retries once an IAM arrives.
#[derive(Debug, Clone)]
pub struct KeyDirectory {
    keys: HashMap<String, PublicKey>,
}

impl KeyDirectory {
    /// Create a directory with the sentinel identity pre-registered
    pub fn new() -> Result<Self, KeyError> {
        let mut keys = HashMap::new();
        keys.insert(NO_ONE.to_string(), KeyPair::no_one()?.public_key);
        Ok(Self { keys })
    }

    /// Upsert a key; the latest announcement wins. Returns true if the
    /// entry was new or changed.
    pub fn record(&mut self, name: &str, key: PublicKey) -> bool {
        match self.keys.insert(name.to_string(), key) {
            Some(previous) if previous == key => false,
            Some(_) => {
                log::warn!("Public key for {} replaced by a newer announcement", name);
                true
            }
            None => true,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&PublicKey> {
        self.keys.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Signer::generate();
        let data = b"Hello, blockchain!";

        let signature = signer.sign(data).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signer.verify(&signer.public_key(), &signature, data));
        assert!(verify_signature(&signer.public_key(), &signature, data));
        assert!(!verify_signature(&signer.public_key(), &signature, b"tampered"));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let signer = Signer::no_one().unwrap();
        assert_eq!(signer.sign(b"genesis").unwrap(), signer.sign(b"genesis").unwrap());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let alice = Signer::generate();
        let bob = Signer::generate();
        let signature = alice.sign(b"pay bob").unwrap();
        assert!(!alice.verify(&bob.public_key(), &signature, b"pay bob"));
    }

    #[test]
    fn test_malformed_signature_is_false() {
        let signer = Signer::generate();
        assert!(!verify_signature(&signer.public_key(), &[1, 2, 3], b"data"));
    }

    #[test]
    fn test_key_pair_from_hex() {
        let kp1 = KeyPair::generate();
        let private_hex = hex::encode(kp1.secret_key.secret_bytes());

        let kp2 = KeyPair::from_private_key_hex(&private_hex).unwrap();
        assert_eq!(kp1.public_key_hex(), kp2.public_key_hex());
        assert!(KeyPair::from_private_key_hex("zz").is_err());
    }

    #[test]
    fn test_directory_has_sentinel() {
        let directory = KeyDirectory::new().unwrap();
        let sentinel = KeyPair::no_one().unwrap();
        assert_eq!(directory.lookup(NO_ONE), Some(&sentinel.public_key));
        assert!(directory.lookup("n1").is_none());
    }

    #[test]
    fn test_directory_last_write_wins() {
        let mut directory = KeyDirectory::new().unwrap();
        let first = KeyPair::generate().public_key;
        let second = KeyPair::generate().public_key;

        assert!(directory.record("n1", first));
        assert!(!directory.record("n1", first));
        assert!(directory.record("n1", second));
        assert_eq!(directory.lookup("n1"), Some(&second));
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_public_key_bytes_round_trip() {
        let signer = Signer::generate();
        let parsed = public_key_from_bytes(&signer.public_key_bytes()).unwrap();
        assert_eq!(parsed, signer.public_key());
        assert!(public_key_from_bytes(&[0u8; 5]).is_err());
    }
}
