use std::collections::{HashMap, HashSet};

use log::{info, warn};
use thiserror::Error;

use super::block::{Block, BlockError};
use super::crypto::KeyPair;
use super::pow::ProofOfWork;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{
    PrevTransactions, Transaction, TransactionError, TxInput, TxOutput, TxOutputs,
};
use super::utxo::UtxoSet;
use crate::config::{ConfigError, LedgerConfig};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Transaction {txid} spends {inputs} but creates {outputs}")]
    ValueMismatch {
        txid: String,
        inputs: u64,
        outputs: u64,
    },

    #[error("Output {vout} of transaction {txid} is not unspent")]
    OutputAlreadySpent { txid: String, vout: i64 },

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Blockchain already exists at {0}")]
    AlreadyExists(String),

    #[error("No blockchain found at {0}")]
    NotInitialized(String),
}

impl BlockchainError {
    /// Whether the error stems from referencing a transaction or output that
    /// is not on the chain, which is a caller bug rather than a runtime failure
    pub fn is_precondition_violation(&self) -> bool {
        match self {
            BlockchainError::TransactionError(err) => err.is_precondition_violation(),
            BlockchainError::BlockError(BlockError::Transaction(err)) => {
                err.is_precondition_violation()
            }
            _ => false,
        }
    }
}

/// A single-writer chain of blocks persisted in sled.
///
/// Mining takes `&mut self`, so the tip can only move through one handle.
#[derive(Debug)]
pub struct Blockchain {
    /// Storage for blocks and the UTXO index
    storage: BlockchainStorage,

    /// Hash of the last block
    tip: Vec<u8>,

    /// Proof-of-work difficulty for new and audited blocks
    difficulty_bits: u32,

    /// Coinbase reward
    subsidy: u64,
}

impl Blockchain {
    /// Creates a new chain and builds its UTXO index
    ///
    /// # Arguments
    ///
    /// * `config` - Ledger settings; `data_dir` must not hold a chain yet
    /// * `genesis_address` - Public key hash rewarded by the genesis coinbase
    ///
    /// # Returns
    ///
    /// A handle whose tip is the mined genesis block
    pub fn create(config: &LedgerConfig, genesis_address: &[u8]) -> Result<Self, BlockchainError> {
        config.validate()?;
        let storage = BlockchainStorage::open(&config.data_dir)?;

        if storage.tip()?.is_some() {
            return Err(BlockchainError::AlreadyExists(
                config.data_dir.display().to_string(),
            ));
        }

        let coinbase = Transaction::new_coinbase(
            genesis_address,
            config.genesis_coinbase_data.as_bytes(),
            config.subsidy,
        )?;
        let genesis = Block::new_genesis(coinbase, config.difficulty_bits)?;
        storage.append_block(&genesis)?;

        info!("Created blockchain with genesis block {}", hex::encode(&genesis.hash));

        let blockchain = Blockchain {
            storage,
            tip: genesis.hash,
            difficulty_bits: config.difficulty_bits,
            subsidy: config.subsidy,
        };
        UtxoSet::new(&blockchain).reindex()?;

        Ok(blockchain)
    }

    /// Opens an existing chain
    pub fn open(config: &LedgerConfig) -> Result<Self, BlockchainError> {
        config.validate()?;
        let storage = BlockchainStorage::open(&config.data_dir)?;

        let tip = storage.tip()?.ok_or_else(|| {
            BlockchainError::NotInitialized(config.data_dir.display().to_string())
        })?;

        info!("Opened blockchain at tip {}", hex::encode(&tip));

        Ok(Blockchain {
            storage,
            tip,
            difficulty_bits: config.difficulty_bits,
            subsidy: config.subsidy,
        })
    }

    /// Hash of the last block
    pub fn tip(&self) -> &[u8] {
        &self.tip
    }

    pub fn difficulty_bits(&self) -> u32 {
        self.difficulty_bits
    }

    pub fn subsidy(&self) -> u64 {
        self.subsidy
    }

    pub(crate) fn storage(&self) -> &BlockchainStorage {
        &self.storage
    }

    /// Walks the chain from the tip back to the genesis block
    pub fn iter(&self) -> ChainIterator<'_> {
        ChainIterator {
            storage: &self.storage,
            current: Some(self.tip.clone()),
        }
    }

    /// Finds a transaction anywhere on the chain.
    ///
    /// A missing transaction is reported as a precondition violation.
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, BlockchainError> {
        for block in self.iter() {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == id) {
                return Ok(tx);
            }
        }

        Err(TransactionError::MissingPreviousTransaction(hex::encode(id)).into())
    }

    /// Transactions referenced by the inputs of `tx`
    fn prev_transactions(&self, tx: &Transaction) -> Result<PrevTransactions, BlockchainError> {
        let mut prev_txs = PrevTransactions::new();
        if tx.is_coinbase() {
            return Ok(prev_txs);
        }

        for input in &tx.inputs {
            if !prev_txs.contains_key(&input.txid) {
                let prev = self.find_transaction(&input.txid)?;
                prev_txs.insert(prev.id.clone(), prev);
            }
        }

        Ok(prev_txs)
    }

    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        key_pair: &KeyPair,
    ) -> Result<(), BlockchainError> {
        let prev_txs = self.prev_transactions(tx)?;
        tx.sign(key_pair, &prev_txs)?;
        Ok(())
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, BlockchainError> {
        let prev_txs = self.prev_transactions(tx)?;
        Ok(tx.verify(&prev_txs)?)
    }

    /// Verifies the transactions, then seals them into a block on top of the
    /// current tip and persists it.
    ///
    /// Every input must spend an output that is unspent on the chain and not
    /// claimed by another transaction of the same block. The UTXO index is
    /// not touched; callers follow up with [`UtxoSet::update`].
    ///
    /// # Arguments
    ///
    /// * `transactions` - Transactions to include, in block order
    ///
    /// # Returns
    ///
    /// The sealed block, which is now the tip
    pub fn mine_block(&mut self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        // Scanned from the blocks so a stale index cannot admit a respend
        let unspent = self.find_all_utxo()?;
        let mut claimed = HashSet::new();

        for tx in &transactions {
            let prev_txs = self.prev_transactions(tx)?;

            if !tx.verify(&prev_txs)? {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "signature check failed for {}",
                    hex::encode(&tx.id)
                )));
            }

            if !tx.is_coinbase() {
                let (inputs, outputs) = tx.value_balance(&prev_txs)?;
                if inputs != outputs {
                    return Err(BlockchainError::ValueMismatch {
                        txid: hex::encode(&tx.id),
                        inputs,
                        outputs,
                    });
                }

                for input in &tx.inputs {
                    let available = unspent
                        .get(&input.txid)
                        .map_or(false, |outputs| outputs.outputs.contains_key(&input.vout));

                    if !available || !claimed.insert((input.txid.as_slice(), input.vout)) {
                        return Err(BlockchainError::OutputAlreadySpent {
                            txid: hex::encode(&input.txid),
                            vout: input.vout,
                        });
                    }
                }
            }
        }

        let block = Block::new(transactions, self.tip.clone(), self.difficulty_bits)?;
        self.storage.append_block(&block)?;
        self.tip = block.hash.clone();

        info!(
            "Mined block {} with {} transactions",
            hex::encode(&block.hash),
            block.transactions.len()
        );

        Ok(block)
    }

    /// Builds and signs a transfer, returning change to the sender
    ///
    /// # Arguments
    ///
    /// * `sender` - Key pair owning the outputs to spend
    /// * `to` - Public key hash of the recipient
    /// * `amount` - Value to transfer; must be positive
    ///
    /// # Returns
    ///
    /// The signed transaction, with a change output when the selected
    /// outputs exceed `amount`
    pub fn new_utxo_transaction(
        &self,
        sender: &KeyPair,
        to: &[u8],
        amount: u64,
    ) -> Result<Transaction, BlockchainError> {
        if amount == 0 {
            return Err(BlockchainError::InvalidTransaction(
                "amount must be positive".to_string(),
            ));
        }

        let sender_hash = sender.pub_key_hash();
        let (accumulated, selection) =
            UtxoSet::new(self).find_spendable_outputs(&sender_hash, amount)?;

        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let inputs = selection
            .into_iter()
            .map(|out_point| TxInput::new(out_point.txid, out_point.vout, sender.public_key_bytes()))
            .collect();

        let mut outputs = vec![TxOutput::new(amount, to.to_vec())];
        if accumulated > amount {
            outputs.push(TxOutput::new(accumulated - amount, sender_hash));
        }

        let mut tx = Transaction::new(inputs, outputs)?;
        self.sign_transaction(&mut tx, sender)?;

        Ok(tx)
    }

    /// Unspent outputs of every transaction, computed from the blocks alone.
    ///
    /// Walks from the tip backwards so that every spend of an output is seen
    /// before the transaction that created it.
    pub fn find_all_utxo(&self) -> Result<HashMap<Vec<u8>, TxOutputs>, BlockchainError> {
        let mut utxo = HashMap::new();
        let mut spent: HashMap<Vec<u8>, HashSet<i64>> = HashMap::new();

        for block in self.iter() {
            let block = block?;

            // Later transactions in a block may spend earlier ones
            for tx in block.transactions.iter().rev() {
                let spent_outputs = spent.get(&tx.id);
                let unspent = TxOutputs {
                    outputs: (0i64..)
                        .zip(&tx.outputs)
                        .filter(|(index, _)| !spent_outputs.map_or(false, |s| s.contains(index)))
                        .map(|(index, output)| (index, output.clone()))
                        .collect(),
                };

                if !unspent.is_empty() {
                    utxo.insert(tx.id.clone(), unspent);
                }

                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent.entry(input.txid.clone()).or_default().insert(input.vout);
                    }
                }
            }
        }

        Ok(utxo)
    }

    /// Audits the chain from tip to genesis: stored hashes, proof of work and
    /// back links.
    pub fn validate_chain(&self) -> Result<bool, BlockchainError> {
        let mut expected_hash = self.tip.clone();

        for block in self.iter() {
            let block = block?;
            let pow = ProofOfWork::new(&block, self.difficulty_bits)?;

            if block.hash != expected_hash {
                warn!("Block {} is not linked from its successor", hex::encode(&block.hash));
                return Ok(false);
            }

            if pow.compute_hash()? != block.hash {
                warn!("Block {} has a stale hash", hex::encode(&block.hash));
                return Ok(false);
            }

            if !pow.validate()? {
                warn!("Block {} fails proof of work", hex::encode(&block.hash));
                return Ok(false);
            }

            expected_hash = block.prev_block_hash.clone();
        }

        Ok(true)
    }
}

/// Lazy walk over the persisted chain from a starting hash back to genesis.
///
/// Yields at most one error, after which it ends.
pub struct ChainIterator<'a> {
    storage: &'a BlockchainStorage,
    current: Option<Vec<u8>>,
}

impl<'a> Iterator for ChainIterator<'a> {
    type Item = Result<Block, BlockchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current.take()?;

        match self.storage.get_block(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.current = Some(block.prev_block_hash.clone());
                }
                Some(Ok(block))
            }
            Err(err) => Some(Err(err.into())),
        }
    }
}
