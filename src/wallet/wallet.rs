//! Wallet: coin selection and transfer construction
//!
//! The wallet owns no keys; it signs through the node's `Signer`.

use crate::core::{Ledger, Transaction, TxId, MAX_VALUE};
use crate::crypto::{KeyError, Signer};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Memo placed on change outputs
pub const CHANGE_MEMO: &str = "change";

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Transfer value must be between 1 and {}", MAX_VALUE)]
    InvalidAmount,
    #[error("Cannot transfer to self")]
    SelfTransfer,
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
}

/// Spending side of a node
#[derive(Debug, Clone)]
pub struct Wallet {
    name: String,
    /// Outputs committed to in-flight transfers: id -> multiplicity
    reserved: HashMap<TxId, usize>,
}

impl Wallet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reserved: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unspent outputs owned by this wallet that no in-flight transfer uses
    pub fn available(&self, ledger: &Ledger) -> Vec<Arc<Transaction>> {
        let mut skipped: HashMap<TxId, usize> = HashMap::new();
        ledger
            .unspent_for(&self.name)
            .into_iter()
            .filter_map(|(id, tx)| {
                let reserved = self.reserved.get(&id).copied().unwrap_or(0);
                let seen = skipped.entry(id).or_insert(0);
                if *seen < reserved {
                    *seen += 1;
                    None
                } else {
                    Some(tx)
                }
            })
            .collect()
    }

    /// Value that can be spent right now, saturating at `u64::MAX`
    pub fn spendable(&self, ledger: &Ledger) -> u64 {
        self.available(ledger)
            .iter()
            .fold(0u64, |sum, tx| sum.saturating_add(tx.value))
    }

    /// Build and sign a transfer of `value` to `to`.
    ///
    /// Inputs are taken in id order until they cover `value`; any excess
    /// returns to the sender as a change output. On success the inputs are
    /// reserved; on failure nothing changes.
    pub fn build_transfer(
        &mut self,
        signer: &Signer,
        ledger: &Ledger,
        to: &str,
        value: u64,
        memo: &str,
    ) -> Result<Transaction, WalletError> {
        if value == 0 || value > MAX_VALUE {
            return Err(WalletError::InvalidAmount);
        }
        if to == self.name {
            return Err(WalletError::SelfTransfer);
        }

        let available = self.available(ledger);
        let have = available
            .iter()
            .fold(0u64, |sum, tx| sum.saturating_add(tx.value));
        if have < value {
            return Err(WalletError::InsufficientFunds { have, need: value });
        }

        let mut inputs = Vec::new();
        let mut selected = 0u128;
        for output in available {
            selected += u128::from(output.value);
            inputs.push(output);
            if selected >= u128::from(value) {
                break;
            }
        }

        let mut outputs = vec![Arc::new(
            Transaction::leaf(&self.name, to, value, memo).signed(signer)?,
        )];
        // The last input pushed `selected` past `value`, so change is below it.
        let change = u64::try_from(selected - u128::from(value)).unwrap_or(u64::MAX);
        if change > 0 {
            outputs.push(Arc::new(
                Transaction::leaf(&self.name, &self.name, change, CHANGE_MEMO).signed(signer)?,
            ));
        }

        let transaction =
            Transaction::new(&self.name, to, value, memo, inputs, outputs).signed(signer)?;

        for input in &transaction.inputs {
            *self.reserved.entry(input.id()).or_insert(0) += 1;
        }
        Ok(transaction)
    }

    /// Release the reservations held by `transaction`
    pub fn release(&mut self, transaction: &Transaction) {
        for input in &transaction.inputs {
            let id = input.id();
            if let Some(count) = self.reserved.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    self.reserved.remove(&id);
                }
            }
        }
    }

    /// Number of reserved outputs, counting multiplicity
    pub fn reserved_len(&self) -> usize {
        self.reserved.values().sum()
    }
}
