//! Value-transfer transactions
//!
//! A transaction moves `value` from `from` to `to`. Its inputs are earlier
//! output transactions being consumed and its outputs are the new leaf
//! transactions it creates (the payment and any change back to the sender).
//! Children are shared behind `Arc`, so a transaction graph is built once
//! and referenced by the ledger's arena and unspent pool without copying.

use crate::codec::{CodecError, Decode, Encode, WireReader, WireWriter};
use crate::crypto::{double_sha256, KeyError, Signer, DIGEST_LEN};
use std::fmt;
use std::sync::Arc;

/// Largest value a single transaction may carry, so balances fit an `i64`
pub const MAX_VALUE: u64 = i64::MAX as u64;

/// Content address of a signed transaction: double SHA-256 of its encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId([u8; DIGEST_LEN]);

impl TxId {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// A signed value transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transaction {
    pub from: String,
    pub to: String,
    pub memo: String,
    pub value: u64,
    pub inputs: Vec<Arc<Transaction>>,
    pub outputs: Vec<Arc<Transaction>>,
    /// Signature of `from` over `signing_bytes()`
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Create an unsigned transaction
    pub fn new(
        from: &str,
        to: &str,
        value: u64,
        memo: &str,
        inputs: Vec<Arc<Transaction>>,
        outputs: Vec<Arc<Transaction>>,
    ) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            memo: memo.to_string(),
            value,
            inputs,
            outputs,
            signature: Vec::new(),
        }
    }

    /// Create an unsigned leaf (an output with no inputs or outputs of its own)
    pub fn leaf(from: &str, to: &str, value: u64, memo: &str) -> Self {
        Self::new(from, to, value, memo, Vec::new(), Vec::new())
    }

    /// Sign with `signer`, replacing any previous signature
    pub fn signed(mut self, signer: &Signer) -> Result<Self, KeyError> {
        self.signature = signer.sign(&self.signing_bytes())?;
        Ok(self)
    }

    /// The bytes covered by the signature: the encoding minus the signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        self.encode_body(&mut writer);
        writer.into_vec()
    }

    pub fn id(&self) -> TxId {
        let digest = double_sha256(&self.to_bytes());
        let mut id = [0u8; DIGEST_LEN];
        id.copy_from_slice(&digest);
        TxId(id)
    }

    pub fn is_leaf(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Whether `name` is the sender or the recipient
    pub fn involves(&self, name: &str) -> bool {
        self.from == name || self.to == name
    }

    // Sums are taken in u128: a block built by a peer may carry outputs
    // whose total does not fit a u64.
    pub fn total_input(&self) -> u128 {
        self.inputs.iter().map(|tx| u128::from(tx.value)).sum()
    }

    pub fn total_output(&self) -> u128 {
        self.outputs.iter().map(|tx| u128::from(tx.value)).sum()
    }

    /// Sum of outputs credited to `name`
    pub fn output_value_to(&self, name: &str) -> u128 {
        self.outputs
            .iter()
            .filter(|tx| tx.to == name)
            .map(|tx| u128::from(tx.value))
            .sum()
    }

    /// Whether the declared value and the outputs tell the same story:
    /// outputs to the recipient equal `value` and outputs do not exceed inputs.
    ///
    /// The ledger does not enforce this; it is reported for diagnostics.
    pub fn is_balanced(&self) -> bool {
        if self.inputs.is_empty() {
            return true;
        }
        self.output_value_to(&self.to) == u128::from(self.value)
            && self.total_output() <= self.total_input()
    }

    fn encode_body(&self, writer: &mut WireWriter) {
        writer.put_str(&self.from);
        writer.put_str(&self.to);
        writer.put_str(&self.memo);
        writer.put_u64(self.value);
        writer.put_u32(self.inputs.len() as u32);
        for input in &self.inputs {
            writer.put_encoded(input.as_ref());
        }
        writer.put_u32(self.outputs.len() as u32);
        for output in &self.outputs {
            writer.put_encoded(output.as_ref());
        }
    }
}

impl Encode for Transaction {
    fn encode(&self, writer: &mut WireWriter) {
        self.encode_body(writer);
        writer.put_bytes(&self.signature);
    }
}

fn decode_children(reader: &mut WireReader<'_>) -> Result<Vec<Arc<Transaction>>, CodecError> {
    let count = reader.get_u32()? as usize;
    // Each child needs at least its 4-byte length prefix.
    if count > reader.remaining() / 4 {
        return Err(CodecError::MalformedMessage(format!(
            "transaction claims {} children in {} bytes",
            count,
            reader.remaining()
        )));
    }
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        children.push(Arc::new(reader.get_decoded::<Transaction>()?));
    }
    Ok(children)
}

impl Decode for Transaction {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let from = reader.get_string()?;
        let to = reader.get_string()?;
        let memo = reader.get_string()?;
        let value = reader.get_u64()?;
        if value == 0 {
            return Err(CodecError::MalformedMessage(
                "transaction value must be positive".to_string(),
            ));
        }
        if value > MAX_VALUE {
            return Err(CodecError::MalformedMessage(format!(
                "transaction value {} exceeds {}",
                value, MAX_VALUE
            )));
        }
        let inputs = decode_children(reader)?;
        let outputs = decode_children(reader)?;
        let signature = reader.get_bytes()?;

        Ok(Self {
            from,
            to,
            memo,
            value,
            inputs,
            outputs,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(signer: &Signer) -> Transaction {
        let input = Arc::new(Transaction::leaf("NO_ONE", "n1", 10, "stake"));
        let pay = Arc::new(Transaction::leaf("n1", "n2", 3, "").signed(signer).unwrap());
        let change = Arc::new(Transaction::leaf("n1", "n1", 7, "").signed(signer).unwrap());
        Transaction::new("n1", "n2", 3, "coffee", vec![input], vec![pay, change])
            .signed(signer)
            .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let signer = Signer::generate();
        let tx = transfer(&signer);
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.id(), tx.id());
    }

    #[test]
    fn test_signature_covers_body() {
        let signer = Signer::generate();
        let tx = transfer(&signer);
        assert!(signer.verify(&signer.public_key(), &tx.signature, &tx.signing_bytes()));

        let mut tampered = tx.clone();
        tampered.value = 4;
        assert!(!signer.verify(
            &signer.public_key(),
            &tampered.signature,
            &tampered.signing_bytes()
        ));
    }

    #[test]
    fn test_id_depends_on_signature() {
        let signer = Signer::generate();
        let unsigned = Transaction::leaf("n1", "n2", 1, "");
        let signed = unsigned.clone().signed(&signer).unwrap();
        assert_ne!(unsigned.id(), signed.id());
        assert_eq!(signed.id(), signed.clone().id());
    }

    #[test]
    fn test_balance_helpers() {
        let signer = Signer::generate();
        let tx = transfer(&signer);
        assert_eq!(tx.total_input(), 10);
        assert_eq!(tx.total_output(), 10);
        assert_eq!(tx.output_value_to("n2"), 3);
        assert!(tx.is_balanced());
        assert!(tx.involves("n2"));
        assert!(!tx.involves("n3"));

        let mut inflated = tx;
        inflated.value = 5;
        assert!(!inflated.is_balanced());
    }

    #[test]
    fn test_zero_value_rejected() {
        let mut tx = Transaction::leaf("n1", "n2", 1, "");
        tx.value = 0;
        assert!(matches!(
            Transaction::from_bytes(&tx.to_bytes()),
            Err(CodecError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let at_limit = Transaction::leaf("n1", "n2", MAX_VALUE, "");
        assert!(Transaction::from_bytes(&at_limit.to_bytes()).is_ok());

        let over = Transaction::leaf("n1", "n2", MAX_VALUE + 1, "");
        assert!(matches!(
            Transaction::from_bytes(&over.to_bytes()),
            Err(CodecError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_totals_do_not_overflow() {
        let half = u64::MAX / 2 + 1;
        let outputs = vec![
            Arc::new(Transaction::leaf("n1", "n2", half, "")),
            Arc::new(Transaction::leaf("n1", "n1", half, "")),
        ];
        let tx = Transaction::new("n1", "n2", half, "", Vec::new(), outputs.clone());
        assert_eq!(tx.total_output(), 2 * u128::from(half));

        let input = Arc::new(Transaction::leaf("NO_ONE", "n1", 1, ""));
        let spend = Transaction::new("n1", "n2", half, "", vec![input], outputs);
        assert!(!spend.is_balanced());
    }

    #[test]
    fn test_truncated_transaction_rejected() {
        let signer = Signer::generate();
        let bytes = transfer(&signer).to_bytes();
        for cut in [0, 5, bytes.len() / 2, bytes.len() - 1] {
            assert!(Transaction::from_bytes(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_excessive_nesting_rejected() {
        let mut tx = Transaction::leaf("a", "b", 1, "");
        for _ in 0..(crate::codec::MAX_NESTING_DEPTH + 1) {
            tx = Transaction::new("a", "b", 1, "", vec![Arc::new(tx)], Vec::new());
        }
        assert!(Transaction::from_bytes(&tx.to_bytes()).is_err());
    }
}
