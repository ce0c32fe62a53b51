// Blockchain module
//
// This module contains the ledger engine:
// - Block assembly and proof of work
// - Transactions with per-input signatures
// - Persistent chain storage
// - The UTXO index

pub mod block;
pub mod chain;
pub mod crypto;
pub mod merkle;
pub mod pow;
pub mod storage;
pub mod transaction;
pub mod utxo;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, ChainIterator};
pub use crypto::KeyPair;
pub use transaction::{Transaction, TxInput, TxOutput, TxOutputs};
pub use utxo::{OutPoint, UtxoSet};
