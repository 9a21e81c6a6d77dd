//! Wallet module for coin selection and transfer construction

pub mod wallet;

pub use wallet::{Wallet, WalletError, CHANGE_MEMO};
