//! The hash-chained ledger
//!
//! Owns the chain, the confirmed transactions, the unspent pool and the
//! latest hash. `add_block` is the only mutator and is all-or-nothing:
//! every check runs before the first write.

use crate::config::GenesisConfig;
use crate::core::block::Block;
use crate::core::transaction::{Transaction, TxId};
use crate::crypto::{KeyError, Signer, NO_ONE};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Sentinel beneficiary of the genesis stake
pub const GENESIS: &str = "GENESIS";

/// Initial stake granted by the genesis transaction
pub const DEFAULT_GENESIS_STAKE: u64 = 50;

/// Memo carried by the genesis transaction and its output
pub const GENESIS_MEMO: &str = "genesis";

/// Block admission failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Duplicate block")]
    Duplicate,
    #[error("Block hash does not continue the chain")]
    BadHash,
    #[error("Input {0} is not unspent")]
    BadInputs(TxId),
}

/// The ledger of one node
#[derive(Debug, Clone)]
pub struct Ledger {
    chain: Vec<Block>,
    confirmed: Vec<Arc<Transaction>>,
    /// Every output ever admitted, by id
    arena: HashMap<TxId, Arc<Transaction>>,
    /// Multiset of spendable outputs: id -> multiplicity
    unspent: HashMap<TxId, usize>,
    latest_hash: Vec<u8>,
    required_zero_bits: u32,
}

impl Ledger {
    /// Create a ledger seeded with the genesis block
    pub fn new(genesis: &GenesisConfig, required_zero_bits: u32) -> Result<Self, KeyError> {
        let block = Self::genesis_block(&genesis.beneficiary, genesis.stake)?;
        let mut ledger = Self {
            chain: Vec::new(),
            confirmed: Vec::new(),
            arena: HashMap::new(),
            unspent: HashMap::new(),
            latest_hash: Vec::new(),
            required_zero_bits,
        };
        ledger.append(block);
        Ok(ledger)
    }

    /// The founding block: `NO_ONE` grants `stake` to `beneficiary`,
    /// hashed from an empty previous hash.
    ///
    /// Signatures are deterministic, so every node derives the same block.
    pub fn genesis_block(beneficiary: &str, stake: u64) -> Result<Block, KeyError> {
        let sentinel = Signer::no_one()?;
        let output = Transaction::leaf(NO_ONE, beneficiary, stake, GENESIS_MEMO).signed(&sentinel)?;
        let transaction = Transaction::new(
            NO_ONE,
            beneficiary,
            stake,
            GENESIS_MEMO,
            Vec::new(),
            vec![Arc::new(output)],
        )
        .signed(&sentinel)?;
        Ok(Block::new(NO_ONE, Vec::new(), transaction, 0).confirm(0))
    }

    /// Build an unconfirmed block for `transaction` on top of the chain.
    /// Does not modify the ledger.
    pub fn next_block(&self, from: &str, transaction: Transaction) -> Block {
        Block::new(
            from,
            self.latest_hash.clone(),
            transaction,
            self.required_zero_bits,
        )
    }

    /// Check that `block` is the hash continuation of the current chain head
    pub fn check_hash(&self, block: &Block) -> Result<(), LedgerError> {
        if block.prev_hash != self.latest_hash {
            return Err(LedgerError::BadHash);
        }
        let expected = Block::compute_hash(&self.latest_hash, &block.transaction);
        if block.hash != expected {
            return Err(LedgerError::BadHash);
        }
        Ok(())
    }

    /// Admit a block. On any error the ledger is left untouched.
    pub fn add_block(&mut self, block: Block) -> Result<(), LedgerError> {
        if self.contains_block(&block) {
            return Err(LedgerError::Duplicate);
        }

        self.check_hash(&block)?;

        // Validate every input before consuming any.
        let mut needed: HashMap<TxId, usize> = HashMap::new();
        for input in &block.transaction.inputs {
            *needed.entry(input.id()).or_insert(0) += 1;
        }
        for (id, count) in &needed {
            if self.unspent.get(id).copied().unwrap_or(0) < *count {
                return Err(LedgerError::BadInputs(*id));
            }
        }

        for (id, count) in needed {
            if let Some(available) = self.unspent.get_mut(&id) {
                *available -= count;
                if *available == 0 {
                    self.unspent.remove(&id);
                }
            }
        }

        if !block.transaction.is_balanced() {
            log::warn!(
                "Admitting block {} whose transaction value does not match its outputs",
                block.short_hash()
            );
        }

        self.append(block);
        Ok(())
    }

    fn append(&mut self, block: Block) {
        let transaction = Arc::new(block.transaction.clone());
        for output in &transaction.outputs {
            let id = output.id();
            self.arena.entry(id).or_insert_with(|| Arc::clone(output));
            *self.unspent.entry(id).or_insert(0) += 1;
        }
        self.latest_hash = block.hash.clone();
        self.confirmed.push(transaction);
        self.chain.push(block);
    }

    /// Outputs credited to `name` minus inputs debited from `name`, over
    /// all confirmed transactions, clamped to the `i64` range
    pub fn balance(&self, name: &str) -> i64 {
        let total: i128 = self
            .confirmed
            .iter()
            .map(|tx| {
                let credited: i128 = tx
                    .outputs
                    .iter()
                    .filter(|output| output.to == name)
                    .map(|output| i128::from(output.value))
                    .sum();
                let debited: i128 = tx
                    .inputs
                    .iter()
                    .filter(|input| input.to == name)
                    .map(|input| i128::from(input.value))
                    .sum();
                credited - debited
            })
            .sum();
        total.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }

    /// Spendable outputs owned by `name`, one entry per multiplicity,
    /// ordered by id so selection is deterministic
    pub fn unspent_for(&self, name: &str) -> Vec<(TxId, Arc<Transaction>)> {
        let mut owned: Vec<(TxId, Arc<Transaction>)> = self
            .unspent
            .iter()
            .filter_map(|(id, count)| {
                let tx = self.arena.get(id)?;
                (tx.to == name).then(|| std::iter::repeat((*id, Arc::clone(tx))).take(*count))
            })
            .flatten()
            .collect();
        owned.sort_by(|a, b| a.0.cmp(&b.0));
        owned
    }

    pub fn is_unspent(&self, id: &TxId) -> bool {
        self.unspent.contains_key(id)
    }

    /// Multiplicity of `id` in the unspent pool
    pub fn unspent_count(&self, id: &TxId) -> usize {
        self.unspent.get(id).copied().unwrap_or(0)
    }

    /// Total number of spendable outputs, counting multiplicity
    pub fn unspent_len(&self) -> usize {
        self.unspent.values().sum()
    }

    pub fn contains_block(&self, block: &Block) -> bool {
        self.chain.iter().any(|existing| existing == block)
    }

    /// Block whose hash is `hash`, if any
    pub fn get_block_by_hash(&self, hash: &[u8]) -> Option<&Block> {
        self.chain.iter().find(|block| block.hash == hash)
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn confirmed_transactions(&self) -> &[Arc<Transaction>] {
        &self.confirmed
    }

    pub fn latest_hash(&self) -> &[u8] {
        &self.latest_hash
    }

    /// Number of blocks after genesis
    pub fn height(&self) -> usize {
        self.chain.len().saturating_sub(1)
    }

    pub fn required_zero_bits(&self) -> u32 {
        self.required_zero_bits
    }

    /// Re-walk the chain: every block links to its predecessor and hashes
    /// correctly, and the head matches `latest_hash`.
    pub fn is_valid(&self) -> bool {
        let mut prev: &[u8] = &[];
        for block in &self.chain {
            if block.prev_hash != prev || !block.verify_hash() {
                return false;
            }
            prev = block.hash.as_slice();
        }
        prev == self.latest_hash.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        Ledger::new(&GenesisConfig::default(), 0).unwrap()
    }

    /// Spend `inputs` owned by `from`, paying `value` to `to` with change
    fn transfer(
        signer: &Signer,
        from: &str,
        to: &str,
        value: u64,
        inputs: Vec<Arc<Transaction>>,
    ) -> Transaction {
        let total: u64 = inputs.iter().map(|tx| tx.value).sum();
        let mut outputs = vec![Arc::new(
            Transaction::leaf(from, to, value, "").signed(signer).unwrap(),
        )];
        if total > value {
            outputs.push(Arc::new(
                Transaction::leaf(from, from, total - value, "change")
                    .signed(signer)
                    .unwrap(),
            ));
        }
        Transaction::new(from, to, value, "", inputs, outputs)
            .signed(signer)
            .unwrap()
    }

    fn owned(ledger: &Ledger, name: &str) -> Vec<Arc<Transaction>> {
        ledger
            .unspent_for(name)
            .into_iter()
            .map(|(_, tx)| tx)
            .collect()
    }

    #[test]
    fn test_genesis_state() {
        let ledger = ledger();
        assert_eq!(ledger.chain().len(), 1);
        assert_eq!(ledger.height(), 0);
        assert_eq!(ledger.balance(GENESIS), 50);
        assert_eq!(ledger.unspent_len(), 1);
        assert_eq!(ledger.latest_hash(), ledger.chain()[0].hash.as_slice());
        assert!(ledger.chain()[0].prev_hash.is_empty());
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_genesis_is_identical_everywhere() {
        assert_eq!(ledger().latest_hash(), ledger().latest_hash());
        let custom = GenesisConfig {
            beneficiary: "n1".to_string(),
            stake: 10,
        };
        let other = Ledger::new(&custom, 0).unwrap();
        assert_ne!(other.latest_hash(), ledger().latest_hash());
        assert_eq!(other.balance("n1"), 10);
    }

    #[test]
    fn test_next_block_does_not_mutate() {
        let ledger = ledger();
        let signer = Signer::generate();
        let tx = transfer(&signer, GENESIS, "a", 5, owned(&ledger, GENESIS));
        let block = ledger.next_block(GENESIS, tx);

        assert!(!block.confirmed);
        assert_eq!(block.prev_hash, ledger.latest_hash());
        assert_eq!(ledger.chain().len(), 1);
        assert_eq!(ledger.check_hash(&block), Ok(()));
    }

    #[test]
    fn test_add_block_moves_value() {
        let mut ledger = ledger();
        let signer = Signer::generate();
        let tx = transfer(&signer, GENESIS, "a", 20, owned(&ledger, GENESIS));
        let block = ledger.next_block(GENESIS, tx);

        assert_eq!(ledger.add_block(block.clone()), Ok(()));
        assert_eq!(ledger.balance(GENESIS), 30);
        assert_eq!(ledger.balance("a"), 20);
        assert_eq!(ledger.latest_hash(), block.hash.as_slice());
        assert_eq!(ledger.unspent_len(), 2);
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_duplicate_rejected_without_mutation() {
        let mut ledger = ledger();
        let signer = Signer::generate();
        let tx = transfer(&signer, GENESIS, "a", 20, owned(&ledger, GENESIS));
        let block = ledger.next_block(GENESIS, tx);
        ledger.add_block(block.clone()).unwrap();

        let latest = ledger.latest_hash().to_vec();
        let confirmed = ledger.confirmed_transactions().len();
        let unspent = ledger.unspent_len();

        assert_eq!(ledger.add_block(block), Err(LedgerError::Duplicate));
        assert_eq!(ledger.latest_hash(), latest.as_slice());
        assert_eq!(ledger.confirmed_transactions().len(), confirmed);
        assert_eq!(ledger.unspent_len(), unspent);
    }

    #[test]
    fn test_bad_hash_rejected() {
        let mut ledger = ledger();
        let signer = Signer::generate();
        let tx = transfer(&signer, GENESIS, "a", 20, owned(&ledger, GENESIS));
        let mut block = ledger.next_block(GENESIS, tx);
        block.prev_hash = vec![9u8; 32];
        block.hash = Block::compute_hash(&block.prev_hash, &block.transaction);

        assert_eq!(ledger.check_hash(&block), Err(LedgerError::BadHash));
        assert_eq!(ledger.add_block(block), Err(LedgerError::BadHash));
        assert_eq!(ledger.chain().len(), 1);
    }

    #[test]
    fn test_bad_inputs_is_atomic() {
        let mut ledger = ledger();
        let signer = Signer::generate();
        let present = owned(&ledger, GENESIS);
        let present_id = present[0].id();
        let absent = Arc::new(Transaction::leaf(GENESIS, GENESIS, 5, "phantom"));

        let mut inputs = present.clone();
        inputs.push(absent.clone());
        let tx = transfer(&signer, GENESIS, "a", 20, inputs);
        let block = ledger.next_block(GENESIS, tx);

        assert_eq!(
            ledger.add_block(block),
            Err(LedgerError::BadInputs(absent.id()))
        );
        assert!(ledger.is_unspent(&present_id));
        assert_eq!(ledger.unspent_len(), 1);
        assert_eq!(ledger.balance(GENESIS), 50);
    }

    #[test]
    fn test_double_spend_rejected() {
        let mut ledger = ledger();
        let signer = Signer::generate();
        let inputs = owned(&ledger, GENESIS);

        let first = ledger.next_block(GENESIS, transfer(&signer, GENESIS, "a", 10, inputs.clone()));
        ledger.add_block(first).unwrap();

        let second = ledger.next_block(GENESIS, transfer(&signer, GENESIS, "b", 10, inputs));
        assert!(matches!(
            ledger.add_block(second),
            Err(LedgerError::BadInputs(_))
        ));
        assert_eq!(ledger.balance("b"), 0);
    }

    #[test]
    fn test_repeated_input_needs_multiplicity() {
        let mut ledger = ledger();
        let signer = Signer::generate();
        let input = owned(&ledger, GENESIS).remove(0);
        let tx = transfer(&signer, GENESIS, "a", 60, vec![input.clone(), input]);
        let block = ledger.next_block(GENESIS, tx);

        assert!(matches!(
            ledger.add_block(block),
            Err(LedgerError::BadInputs(_))
        ));
        assert_eq!(ledger.unspent_len(), 1);
    }

    #[test]
    fn test_unbalanced_block_with_huge_outputs_is_admitted() {
        let mut ledger = ledger();
        let signer = Signer::generate();
        let half = u64::MAX / 2 + 1;
        let outputs = vec![
            Arc::new(Transaction::leaf(GENESIS, "a", half, "").signed(&signer).unwrap()),
            Arc::new(Transaction::leaf(GENESIS, "b", half, "").signed(&signer).unwrap()),
        ];
        let tx = Transaction::new(GENESIS, "a", half, "", owned(&ledger, GENESIS), outputs)
            .signed(&signer)
            .unwrap();
        let block = ledger.next_block(GENESIS, tx);

        assert_eq!(ledger.add_block(block), Ok(()));
        assert_eq!(ledger.height(), 1);
        assert_eq!(ledger.balance("a"), i64::MAX);
        assert_eq!(ledger.balance("b"), i64::MAX);
        assert_eq!(ledger.balance(GENESIS), 0);
    }

    #[test]
    fn test_balance_of_maximal_output_is_not_negative() {
        let mut ledger = ledger();
        let signer = Signer::generate();
        let outputs = vec![Arc::new(
            Transaction::leaf(GENESIS, "a", u64::MAX, "").signed(&signer).unwrap(),
        )];
        let tx = Transaction::new(GENESIS, "a", u64::MAX, "", owned(&ledger, GENESIS), outputs)
            .signed(&signer)
            .unwrap();
        let block = ledger.next_block(GENESIS, tx);
        ledger.add_block(block).unwrap();

        assert_eq!(ledger.balance("a"), i64::MAX);
    }

    #[test]
    fn test_balance_conservation_over_chain() {
        let mut ledger = ledger();
        let parties = [GENESIS, "a", "b", "c"];
        let signers: Vec<Signer> = parties.iter().map(|_| Signer::generate()).collect();
        let moves = [(0, 1, 20), (1, 2, 5), (2, 3, 5), (0, 3, 30), (3, 1, 12)];

        for (from, to, value) in moves {
            let inputs = owned(&ledger, parties[from]);
            let tx = transfer(&signers[from], parties[from], parties[to], value, inputs);
            let block = ledger.next_block(parties[from], tx);
            ledger.add_block(block).unwrap();

            let total: i64 = parties.iter().map(|p| ledger.balance(p)).sum();
            assert_eq!(total, 50);
        }

        assert_eq!(ledger.balance(GENESIS), 0);
        assert_eq!(ledger.balance("a"), 27);
        assert_eq!(ledger.balance("b"), 0);
        assert_eq!(ledger.balance("c"), 23);
        assert_eq!(ledger.height(), moves.len());
        assert!(ledger.is_valid());
    }
}
