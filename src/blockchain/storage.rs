use std::collections::HashMap;
use std::path::Path;

use log::debug;
use sled::transaction::{abort, TransactionError as SledTransactionError};
use sled::{Batch, Tree};
use thiserror::Error;

use super::block::Block;
use super::transaction::TxOutputs;

const BLOCKS_TREE: &str = "blocks";
const CHAINSTATE_TREE: &str = "chainstate";

/// Key in the blocks tree holding the hash of the last block
const TIP_KEY: &[u8] = b"l";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

impl From<SledTransactionError<StorageError>> for StorageError {
    fn from(err: SledTransactionError<StorageError>) -> Self {
        match err {
            SledTransactionError::Abort(err) => err,
            SledTransactionError::Storage(err) => StorageError::DatabaseError(err),
        }
    }
}

/// One step of incremental UTXO maintenance, applied in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtxoChange {
    /// Remove output `vout` from the entry of `txid`
    Spend { txid: Vec<u8>, vout: i64 },

    /// Write the entry of `txid`
    Create { txid: Vec<u8>, outputs: TxOutputs },
}

/// Storage for blockchain data.
///
/// The `blocks` tree maps block hash to encoded block, plus the tip pointer.
/// The `chainstate` tree maps transaction ID to its unspent outputs and can
/// be rebuilt from `blocks` at any time.
pub struct BlockchainStorage {
    /// Tree for blocks and the tip pointer
    blocks: Tree,

    /// Tree for the UTXO index
    chainstate: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    ///
    /// # Returns
    ///
    /// A storage handle over the `blocks` and `chainstate` trees
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree(BLOCKS_TREE)?;
        let chainstate = db.open_tree(CHAINSTATE_TREE)?;

        Ok(Self { blocks, chainstate })
    }

    /// Hash of the last block, if a chain exists
    pub fn tip(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blocks.get(TIP_KEY)?.map(|hash| hash.to_vec()))
    }

    /// Gets a block by its hash
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        match self.blocks.get(hash)? {
            Some(value) => Block::from_bytes(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string())),
            None => Err(StorageError::NotFound(format!(
                "Block with hash {} not found",
                hex::encode(hash)
            ))),
        }
    }

    /// Saves a block and moves the tip to it in one transaction
    ///
    /// # Arguments
    ///
    /// * `block` - The sealed block to persist
    ///
    /// # Returns
    ///
    /// Ok(()) once the block and the tip are flushed
    pub fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let value = block
            .to_bytes()
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let key = block.hash.as_slice();

        let result: Result<(), SledTransactionError<StorageError>> =
            self.blocks.transaction(|tree| {
                tree.insert(key, value.as_slice())?;
                tree.insert(TIP_KEY, key)?;
                Ok(())
            });
        result?;

        self.blocks.flush()?;
        debug!("Appended block {}", hex::encode(key));

        Ok(())
    }

    /// Gets the unspent outputs recorded for a transaction
    pub fn get_unspent(&self, txid: &[u8]) -> Result<Option<TxOutputs>, StorageError> {
        self.chainstate
            .get(txid)?
            .map(|value| decode_outputs(&value))
            .transpose()
    }

    /// Iterates the UTXO index in key order
    pub fn unspent_entries(
        &self,
    ) -> impl Iterator<Item = Result<(Vec<u8>, TxOutputs), StorageError>> + '_ {
        self.chainstate.iter().map(|entry| {
            let (key, value) = entry?;
            Ok((key.to_vec(), decode_outputs(&value)?))
        })
    }

    /// Replaces the whole UTXO index with `entries` in one batch
    pub fn replace_unspent(
        &self,
        entries: &HashMap<Vec<u8>, TxOutputs>,
    ) -> Result<(), StorageError> {
        let mut batch = Batch::default();

        for key in self.chainstate.iter().keys() {
            batch.remove(key?);
        }

        for (txid, outputs) in entries {
            if outputs.is_empty() {
                continue;
            }
            batch.insert(txid.as_slice(), encode_outputs(outputs)?);
        }

        self.chainstate.apply_batch(batch)?;
        self.chainstate.flush()?;

        Ok(())
    }

    /// Applies incremental UTXO changes in one transaction.
    ///
    /// Spending an output that is not in the index aborts the whole update.
    /// Entries left without outputs are deleted.
    pub fn apply_utxo_changes(&self, changes: &[UtxoChange]) -> Result<(), StorageError> {
        let result: Result<(), SledTransactionError<StorageError>> =
            self.chainstate.transaction(|tree| {
                for change in changes {
                    match change {
                        UtxoChange::Spend { txid, vout } => {
                            let value = match tree.get(txid.as_slice())? {
                                Some(value) => value,
                                None => {
                                    return abort(StorageError::NotFound(format!(
                                        "Unspent outputs of {} not found",
                                        hex::encode(txid)
                                    )))
                                }
                            };

                            let mut outputs = match decode_outputs(&value) {
                                Ok(outputs) => outputs,
                                Err(err) => return abort(err),
                            };
                            if outputs.spend(*vout).is_none() {
                                return abort(StorageError::NotFound(format!(
                                    "Output {} of {} is not unspent",
                                    vout,
                                    hex::encode(txid)
                                )));
                            }

                            if outputs.is_empty() {
                                tree.remove(txid.as_slice())?;
                            } else {
                                match encode_outputs(&outputs) {
                                    Ok(bytes) => tree.insert(txid.as_slice(), bytes)?,
                                    Err(err) => return abort(err),
                                };
                            }
                        }
                        UtxoChange::Create { txid, outputs } => {
                            if outputs.is_empty() {
                                continue;
                            }
                            match encode_outputs(outputs) {
                                Ok(bytes) => tree.insert(txid.as_slice(), bytes)?,
                                Err(err) => return abort(err),
                            };
                        }
                    }
                }

                Ok(())
            });
        result?;

        self.chainstate.flush()?;

        Ok(())
    }
}

fn encode_outputs(outputs: &TxOutputs) -> Result<Vec<u8>, StorageError> {
    outputs
        .to_bytes()
        .map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode_outputs(bytes: &[u8]) -> Result<TxOutputs, StorageError> {
    TxOutputs::from_bytes(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}
