use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::merkle::MerkleTree;
use super::pow::ProofOfWork;
use super::transaction::{Transaction, TransactionError};

/// Errors that can occur while assembling or sealing a block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Difficulty must be between 1 and 256 bits, got {0}")]
    InvalidDifficulty(u32),

    #[error("Nonce space exhausted without meeting the target")]
    NonceExhausted,
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Creation time in seconds since the Unix epoch
    pub timestamp: i64,

    /// Transactions in construction order
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block, empty for the genesis block
    pub prev_block_hash: Vec<u8>,

    /// Hash found by sealing
    pub hash: Vec<u8>,

    /// Nonce found by sealing
    pub nonce: u64,
}

impl Block {
    /// Creates and seals a new block
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to include in the block
    /// * `prev_block_hash` - The hash of the current tip
    /// * `difficulty_bits` - The proof-of-work difficulty
    pub fn new(
        transactions: Vec<Transaction>,
        prev_block_hash: Vec<u8>,
        difficulty_bits: u32,
    ) -> Result<Self, BlockError> {
        let mut block = Block {
            timestamp: Utc::now().timestamp(),
            transactions,
            prev_block_hash,
            hash: Vec::new(),
            nonce: 0,
        };

        let (nonce, hash) = ProofOfWork::new(&block, difficulty_bits)?.run()?;
        block.nonce = nonce;
        block.hash = hash;

        Ok(block)
    }

    /// Creates the first block of a chain around its coinbase transaction
    pub fn new_genesis(coinbase: Transaction, difficulty_bits: u32) -> Result<Self, BlockError> {
        Block::new(vec![coinbase], Vec::new(), difficulty_bits)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash.is_empty()
    }

    /// Merkle root over the fingerprints of the block's transactions
    pub fn hash_transactions(&self) -> Result<Vec<u8>, BlockError> {
        let fingerprints = self
            .transactions
            .iter()
            .map(Transaction::hash)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MerkleTree::build(&fingerprints).root_hash().to_vec())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockError> {
        bincode::serialize(self).map_err(|e| BlockError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        bincode::deserialize(bytes).map_err(|e| BlockError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::KeyPair;

    fn coinbase() -> Transaction {
        Transaction::new_coinbase(&KeyPair::generate().pub_key_hash(), b"", 10).unwrap()
    }

    #[test]
    fn test_new_genesis_block() {
        let tx = coinbase();
        let block = Block::new_genesis(tx.clone(), 8).unwrap();

        assert!(block.is_genesis());
        assert_eq!(block.transactions, vec![tx]);
        assert_eq!(block.hash.len(), 32);
        assert!(block.timestamp > 0);
    }

    #[test]
    fn test_new_block_links_previous() {
        let genesis = Block::new_genesis(coinbase(), 8).unwrap();
        let block = Block::new(vec![coinbase()], genesis.hash.clone(), 8).unwrap();

        assert!(!block.is_genesis());
        assert_eq!(block.prev_block_hash, genesis.hash);
        assert_ne!(block.hash, genesis.hash);
    }

    #[test]
    fn test_commitment_tracks_transactions() {
        let block = Block::new(vec![coinbase(), coinbase()], Vec::new(), 8).unwrap();
        let commitment = block.hash_transactions().unwrap();

        let mut reordered = block.clone();
        reordered.transactions.reverse();
        assert_ne!(reordered.hash_transactions().unwrap(), commitment);

        let mut altered = block.clone();
        altered.transactions[0].outputs[0].value += 1;
        assert_ne!(altered.hash_transactions().unwrap(), commitment);
    }

    #[test]
    fn test_encoding_round_trip() {
        let genesis = Block::new_genesis(coinbase(), 8).unwrap();
        let decoded = Block::from_bytes(&genesis.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, genesis);

        let empty = Block {
            timestamp: 0,
            transactions: Vec::new(),
            prev_block_hash: Vec::new(),
            hash: Vec::new(),
            nonce: 0,
        };
        assert_eq!(Block::from_bytes(&empty.to_bytes().unwrap()).unwrap(), empty);

        let bytes = genesis.to_bytes().unwrap();
        assert!(matches!(
            Block::from_bytes(&bytes[..bytes.len() / 2]),
            Err(BlockError::Encoding(_))
        ));
    }
}
