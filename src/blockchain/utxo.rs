use std::collections::BTreeMap;

use log::{debug, info};

use super::block::Block;
use super::chain::{Blockchain, BlockchainError};
use super::storage::UtxoChange;
use super::transaction::{TransactionError, TxOutput, TxOutputs};

/// A reference to one output of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: Vec<u8>,
    pub vout: i64,
}

/// Index of unspent outputs kept in the `chainstate` tree.
///
/// Derived entirely from the chain: [`UtxoSet::reindex`] rebuilds it from
/// scratch and is the recovery path if an incremental update was lost.
pub struct UtxoSet<'a> {
    blockchain: &'a Blockchain,
}

impl<'a> UtxoSet<'a> {
    pub fn new(blockchain: &'a Blockchain) -> Self {
        UtxoSet { blockchain }
    }

    /// Greedily selects outputs locked to `pub_key_hash` until their value
    /// reaches `amount`.
    ///
    /// Entries are visited in the store's key order (transaction ID) and
    /// outputs in index order. The accumulated value is returned even when
    /// it falls short; callers must check it.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, Vec<OutPoint>), BlockchainError> {
        let mut accumulated = 0u64;
        let mut selection = Vec::new();

        for entry in self.blockchain.storage().unspent_entries() {
            if accumulated >= amount {
                break;
            }

            let (txid, outputs) = entry?;
            for (vout, output) in outputs.outputs {
                if accumulated >= amount {
                    break;
                }
                if output.is_locked_with_key(pub_key_hash) {
                    accumulated = accumulated
                        .checked_add(output.value)
                        .ok_or(TransactionError::ValueOverflow)?;
                    selection.push(OutPoint {
                        txid: txid.clone(),
                        vout,
                    });
                }
            }
        }

        Ok((accumulated, selection))
    }

    /// All unspent outputs locked to `pub_key_hash`
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, BlockchainError> {
        let mut utxos = Vec::new();

        for entry in self.blockchain.storage().unspent_entries() {
            let (_, outputs) = entry?;
            utxos.extend(
                outputs
                    .outputs
                    .into_values()
                    .filter(|output| output.is_locked_with_key(pub_key_hash)),
            );
        }

        Ok(utxos)
    }

    /// Sum of the unspent values locked to `pub_key_hash`
    pub fn balance(&self, pub_key_hash: &[u8]) -> Result<u64, BlockchainError> {
        self.find_utxo(pub_key_hash)?
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.value))
            .ok_or_else(|| TransactionError::ValueOverflow.into())
    }

    /// Number of transactions with at least one unspent output
    pub fn count_transactions(&self) -> Result<usize, BlockchainError> {
        let mut count = 0;
        for entry in self.blockchain.storage().unspent_entries() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Snapshot of the whole index
    pub fn entries(&self) -> Result<BTreeMap<Vec<u8>, TxOutputs>, BlockchainError> {
        self.blockchain
            .storage()
            .unspent_entries()
            .map(|entry| entry.map_err(BlockchainError::from))
            .collect()
    }

    /// Rebuilds the index from a full scan of the chain
    pub fn reindex(&self) -> Result<(), BlockchainError> {
        let utxo = self.blockchain.find_all_utxo()?;
        self.blockchain.storage().replace_unspent(&utxo)?;

        info!("Reindexed UTXO set: {} transactions with unspent outputs", utxo.len());
        Ok(())
    }

    /// Applies a newly mined block: drops the outputs its inputs spend and
    /// records every output it creates
    pub fn update(&self, block: &Block) -> Result<(), BlockchainError> {
        let mut changes = Vec::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                changes.extend(tx.inputs.iter().map(|input| UtxoChange::Spend {
                    txid: input.txid.clone(),
                    vout: input.vout,
                }));
            }

            changes.push(UtxoChange::Create {
                txid: tx.id.clone(),
                outputs: TxOutputs::from_outputs(&tx.outputs),
            });
        }

        self.blockchain.storage().apply_utxo_changes(&changes)?;

        debug!(
            "Updated UTXO set for block {} ({} changes)",
            hex::encode(&block.hash),
            changes.len()
        );
        Ok(())
    }
}
