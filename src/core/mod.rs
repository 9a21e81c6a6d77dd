//! Core ledger components
//!
//! This module contains the fundamental building blocks:
//! - Transactions (self-referential inputs/outputs, signed by the sender)
//! - Blocks (one transaction each, hash-chained, confirmed by proof of work)
//! - Ledger (chain, unspent pool, balances, block admission)

pub mod block;
pub mod ledger;
pub mod transaction;

pub use block::Block;
pub use ledger::{Ledger, LedgerError, DEFAULT_GENESIS_STAKE, GENESIS, GENESIS_MEMO};
pub use transaction::{Transaction, TxId, MAX_VALUE};
