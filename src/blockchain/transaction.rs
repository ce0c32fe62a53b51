use std::collections::{BTreeMap, HashMap, HashSet};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{hash_pub_key, sha256, verify_signature, CryptoError, KeyPair};

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_OUTPUT_INDEX: i64 = -1;

/// Number of random bytes used as coinbase data when none is supplied
const COINBASE_RANDOM_DATA_LEN: usize = 20;

/// Referenced transactions, keyed by transaction ID
pub type PrevTransactions = HashMap<Vec<u8>, Transaction>;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Previous transaction not found: {0}")]
    MissingPreviousTransaction(String),

    #[error("Output {vout} does not exist in transaction {txid}")]
    InvalidOutputReference { txid: String, vout: i64 },

    #[error("Output {vout} of transaction {txid} is spent more than once")]
    DuplicateInput { txid: String, vout: i64 },

    #[error("Transaction value overflows")]
    ValueOverflow,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl TransactionError {
    /// Whether the error is a caller bug (dangling reference) rather than a
    /// runtime failure
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            TransactionError::MissingPreviousTransaction(_)
                | TransactionError::InvalidOutputReference { .. }
        )
    }
}

/// A reference to a previous output being spent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// ID of the transaction holding the spent output
    pub txid: Vec<u8>,

    /// Index of the spent output within that transaction
    pub vout: i64,

    /// Signature over this input's signing view of the transaction
    pub signature: Vec<u8>,

    /// Spender's raw public key (arbitrary data for coinbase inputs)
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Creates an unsigned input spending `txid:vout` with the given public key
    pub fn new(txid: Vec<u8>, vout: i64, pub_key: Vec<u8>) -> Self {
        TxInput {
            txid,
            vout,
            signature: Vec::new(),
            pub_key,
        }
    }

    /// Whether the input's public key hashes to the given key hash
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(&self.pub_key) == pub_key_hash
    }
}

/// An amount locked to a public key hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, pub_key_hash: Vec<u8>) -> Self {
        TxOutput {
            value,
            pub_key_hash,
        }
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// The unspent outputs of one transaction, keyed by their original index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputs {
    pub outputs: BTreeMap<i64, TxOutput>,
}

impl TxOutputs {
    /// Collects every output of a transaction at its position
    pub fn from_outputs(outputs: &[TxOutput]) -> Self {
        TxOutputs {
            outputs: (0i64..).zip(outputs.iter().cloned()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Removes the output at `vout`, returning it if it was present
    pub fn spend(&mut self, vout: i64) -> Option<TxOutput> {
        self.outputs.remove(&vout)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::serialize(self).map_err(|e| TransactionError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionError> {
        bincode::deserialize(bytes).map_err(|e| TransactionError::Encoding(e.to_string()))
    }
}

/// A value transfer between public key hashes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content fingerprint, see [`Transaction::hash`]
    pub id: Vec<u8>,

    pub inputs: Vec<TxInput>,

    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Creates a transaction from its parts and sets its ID
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Result<Self, TransactionError> {
        let mut transaction = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };
        transaction.id = transaction.hash()?;

        Ok(transaction)
    }

    /// Creates a coinbase transaction minting `subsidy` to `to`.
    ///
    /// Empty `data` is replaced with random bytes so that two rewards to the
    /// same key hash never share an ID.
    pub fn new_coinbase(to: &[u8], data: &[u8], subsidy: u64) -> Result<Self, TransactionError> {
        let data = if data.is_empty() {
            let mut random = vec![0u8; COINBASE_RANDOM_DATA_LEN];
            rand::thread_rng().fill_bytes(&mut random);
            random
        } else {
            data.to_vec()
        };

        let input = TxInput::new(Vec::new(), COINBASE_OUTPUT_INDEX, data);
        let output = TxOutput::new(subsidy, to.to_vec());

        Transaction::new(vec![input], vec![output])
    }

    /// Whether this is a coinbase (reward) transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].txid.is_empty()
            && self.inputs[0].vout == COINBASE_OUTPUT_INDEX
    }

    /// Fingerprint of the transaction with its ID cleared
    pub fn hash(&self) -> Result<Vec<u8>, TransactionError> {
        let copy = Transaction {
            id: Vec::new(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        };

        Ok(sha256(&copy.to_bytes()?))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::serialize(self).map_err(|e| TransactionError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionError> {
        bincode::deserialize(bytes).map_err(|e| TransactionError::Encoding(e.to_string()))
    }

    /// Copy with every input's signature and public key cleared
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput::new(input.txid.clone(), input.vout, Vec::new()))
            .collect();

        Transaction {
            id: self.id.clone(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Sum of all output values
    pub fn output_value(&self) -> Result<u64, TransactionError> {
        self.outputs.iter().try_fold(0u64, |total, output| {
            total
                .checked_add(output.value)
                .ok_or(TransactionError::ValueOverflow)
        })
    }

    /// Total value consumed by the inputs and total value created by the
    /// outputs. Coinbase inputs consume nothing.
    ///
    /// An output referenced by more than one input is rejected.
    pub fn value_balance(
        &self,
        prev_txs: &PrevTransactions,
    ) -> Result<(u64, u64), TransactionError> {
        let mut input_value = 0u64;
        if !self.is_coinbase() {
            let mut seen = HashSet::with_capacity(self.inputs.len());
            for input in &self.inputs {
                if !seen.insert((input.txid.as_slice(), input.vout)) {
                    return Err(TransactionError::DuplicateInput {
                        txid: hex::encode(&input.txid),
                        vout: input.vout,
                    });
                }

                let spent = referenced_output(prev_txs, input)?;
                input_value = input_value
                    .checked_add(spent.value)
                    .ok_or(TransactionError::ValueOverflow)?;
            }
        }

        Ok((input_value, self.output_value()?))
    }

    /// Signs every input against the output it spends
    pub fn sign(
        &mut self,
        key_pair: &KeyPair,
        prev_txs: &PrevTransactions,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let trimmed = self.trimmed_copy();
        let mut signatures = Vec::with_capacity(self.inputs.len());
        for index in 0..self.inputs.len() {
            let digest = signing_digest(&trimmed, index, prev_txs)?;
            signatures.push(key_pair.sign(&digest));
        }

        for (input, signature) in self.inputs.iter_mut().zip(signatures) {
            input.signature = signature;
        }

        Ok(())
    }

    /// Checks every input's signature and that its key owns the spent output.
    ///
    /// Returns `Ok(false)` for any authorization failure. Dangling references
    /// and malformed signatures are errors.
    pub fn verify(&self, prev_txs: &PrevTransactions) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let trimmed = self.trimmed_copy();
        for (index, input) in self.inputs.iter().enumerate() {
            let spent = referenced_output(prev_txs, input)?;
            if !input.uses_key(&spent.pub_key_hash) {
                return Ok(false);
            }

            let digest = signing_digest(&trimmed, index, prev_txs)?;
            if !verify_signature(&digest, &input.signature, &input.pub_key)? {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// Looks up the output an input spends
pub fn referenced_output<'a>(
    prev_txs: &'a PrevTransactions,
    input: &TxInput,
) -> Result<&'a TxOutput, TransactionError> {
    let prev = prev_txs
        .get(&input.txid)
        .ok_or_else(|| TransactionError::MissingPreviousTransaction(hex::encode(&input.txid)))?;

    usize::try_from(input.vout)
        .ok()
        .and_then(|vout| prev.outputs.get(vout))
        .ok_or_else(|| TransactionError::InvalidOutputReference {
            txid: hex::encode(&input.txid),
            vout: input.vout,
        })
}

/// Fingerprint of the signing view for input `index`: the trimmed copy with
/// only that input's public key slot holding the spent output's lock.
fn signing_digest(
    trimmed: &Transaction,
    index: usize,
    prev_txs: &PrevTransactions,
) -> Result<Vec<u8>, TransactionError> {
    let spent = referenced_output(prev_txs, &trimmed.inputs[index])?;

    let mut view = trimmed.clone();
    view.inputs[index].pub_key = spent.pub_key_hash.clone();

    view.hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funding(owner: &KeyPair, value: u64) -> Transaction {
        Transaction::new_coinbase(&owner.pub_key_hash(), b"funding", value).unwrap()
    }

    fn prev_map(transactions: &[&Transaction]) -> PrevTransactions {
        transactions
            .iter()
            .map(|tx| (tx.id.clone(), (*tx).clone()))
            .collect()
    }

    fn signed_spend(owner: &KeyPair, recipient: &KeyPair, sources: &[&Transaction]) -> Transaction {
        let inputs = sources
            .iter()
            .map(|tx| TxInput::new(tx.id.clone(), 0, owner.public_key_bytes()))
            .collect();
        let total: u64 = sources.iter().map(|tx| tx.outputs[0].value).sum();
        let outputs = vec![
            TxOutput::new(4, recipient.pub_key_hash()),
            TxOutput::new(total - 4, owner.pub_key_hash()),
        ];

        let mut tx = Transaction::new(inputs, outputs).unwrap();
        tx.sign(owner, &prev_map(sources)).unwrap();
        tx
    }

    #[test]
    fn test_coinbase_transaction() {
        let miner = KeyPair::generate();
        let tx = Transaction::new_coinbase(&miner.pub_key_hash(), b"", 10).unwrap();

        assert!(tx.is_coinbase());
        assert_eq!(tx.inputs[0].vout, COINBASE_OUTPUT_INDEX);
        assert_eq!(tx.inputs[0].pub_key.len(), COINBASE_RANDOM_DATA_LEN);
        assert_eq!(tx.outputs, vec![TxOutput::new(10, miner.pub_key_hash())]);
        assert_eq!(tx.id, tx.hash().unwrap());

        // Random data keeps repeated rewards distinct
        let again = Transaction::new_coinbase(&miner.pub_key_hash(), b"", 10).unwrap();
        assert_ne!(tx.id, again.id);
    }

    #[test]
    fn test_is_coinbase_rejects_real_inputs() {
        let owner = KeyPair::generate();
        let source = funding(&owner, 10);
        let spend = signed_spend(&owner, &KeyPair::generate(), &[&source]);
        assert!(!spend.is_coinbase());

        // Sentinel index with a real reference
        let mut fake = source.clone();
        fake.inputs[0].txid = source.id.clone();
        assert!(!fake.is_coinbase());

        // Empty reference with a real index
        let mut fake = source.clone();
        fake.inputs[0].vout = 0;
        assert!(!fake.is_coinbase());

        // Two inputs
        let mut fake = source.clone();
        fake.inputs.push(source.inputs[0].clone());
        assert!(!fake.is_coinbase());
    }

    #[test]
    fn test_hash_ignores_id_and_respects_order() {
        let owner = KeyPair::generate();
        let mut tx = Transaction::new(
            vec![],
            vec![
                TxOutput::new(1, owner.pub_key_hash()),
                TxOutput::new(2, owner.pub_key_hash()),
            ],
        )
        .unwrap();
        let id = tx.id.clone();

        tx.id = b"anything".to_vec();
        assert_eq!(tx.hash().unwrap(), id);

        tx.outputs.swap(0, 1);
        assert_ne!(tx.hash().unwrap(), id);
    }

    #[test]
    fn test_trimmed_copy_clears_signatures() {
        let owner = KeyPair::generate();
        let source = funding(&owner, 10);
        let spend = signed_spend(&owner, &KeyPair::generate(), &[&source]);

        let trimmed = spend.trimmed_copy();
        assert_eq!(trimmed.id, spend.id);
        assert_eq!(trimmed.outputs, spend.outputs);
        for (trimmed_input, input) in trimmed.inputs.iter().zip(&spend.inputs) {
            assert!(trimmed_input.signature.is_empty());
            assert!(trimmed_input.pub_key.is_empty());
            assert_eq!(trimmed_input.txid, input.txid);
            assert_eq!(trimmed_input.vout, input.vout);
        }
    }

    #[test]
    fn test_sign_and_verify_multiple_inputs() {
        let owner = KeyPair::generate();
        let first = funding(&owner, 10);
        let second = funding(&owner, 5);
        let spend = signed_spend(&owner, &KeyPair::generate(), &[&first, &second]);

        let prev = prev_map(&[&first, &second]);
        assert!(spend.verify(&prev).unwrap());

        // Each input is signed against its own view
        assert_ne!(spend.inputs[0].signature, spend.inputs[1].signature);
    }

    #[test]
    fn test_flipped_bits_fail_verification() {
        let owner = KeyPair::generate();
        let source = funding(&owner, 10);
        let spend = signed_spend(&owner, &KeyPair::generate(), &[&source]);
        let prev = prev_map(&[&source]);

        for byte in [0usize, 31, 32, 63] {
            let mut tampered = spend.clone();
            tampered.inputs[0].signature[byte] ^= 0x01;
            assert!(!tampered.verify(&prev).unwrap(), "signature byte {}", byte);
        }

        let mut tampered = spend.clone();
        tampered.outputs[0].value ^= 0x01;
        assert!(!tampered.verify(&prev).unwrap());

        let mut tampered = spend.clone();
        tampered.outputs[1].pub_key_hash[0] ^= 0x80;
        assert!(!tampered.verify(&prev).unwrap());
    }

    #[test]
    fn test_verify_rejects_foreign_key() {
        let owner = KeyPair::generate();
        let thief = KeyPair::generate();
        let source = funding(&owner, 10);
        let prev = prev_map(&[&source]);

        // Thief signs a spend of the owner's output with their own key
        let mut theft = Transaction::new(
            vec![TxInput::new(source.id.clone(), 0, thief.public_key_bytes())],
            vec![TxOutput::new(10, thief.pub_key_hash())],
        )
        .unwrap();
        theft.sign(&thief, &prev).unwrap();

        assert!(!theft.verify(&prev).unwrap());
    }

    #[test]
    fn test_missing_previous_transaction_is_precondition_violation() {
        let owner = KeyPair::generate();
        let source = funding(&owner, 10);
        let mut spend = Transaction::new(
            vec![TxInput::new(source.id.clone(), 0, owner.public_key_bytes())],
            vec![TxOutput::new(10, owner.pub_key_hash())],
        )
        .unwrap();

        let err = spend.sign(&owner, &PrevTransactions::new()).unwrap_err();
        assert!(err.is_precondition_violation());

        let err = spend.verify(&PrevTransactions::new()).unwrap_err();
        assert!(matches!(err, TransactionError::MissingPreviousTransaction(_)));

        spend.inputs[0].vout = 3;
        let err = spend.verify(&prev_map(&[&source])).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidOutputReference { vout: 3, .. }));
    }

    #[test]
    fn test_coinbase_sign_and_verify_are_noops() {
        let owner = KeyPair::generate();
        let mut coinbase = funding(&owner, 10);
        let before = coinbase.clone();

        coinbase.sign(&owner, &PrevTransactions::new()).unwrap();
        assert_eq!(coinbase, before);
        assert!(coinbase.verify(&PrevTransactions::new()).unwrap());
    }

    #[test]
    fn test_value_balance() {
        let owner = KeyPair::generate();
        let first = funding(&owner, 10);
        let second = funding(&owner, 5);
        let spend = signed_spend(&owner, &KeyPair::generate(), &[&first, &second]);

        let balance = spend.value_balance(&prev_map(&[&first, &second])).unwrap();
        assert_eq!(balance, (15, 15));
        assert_eq!(first.value_balance(&PrevTransactions::new()).unwrap(), (0, 10));
    }

    #[test]
    fn test_value_balance_rejects_repeated_input() {
        let owner = KeyPair::generate();
        let source = funding(&owner, 10);

        // Both inputs spend source:0, so 10 in would back 20 out
        let doubled = signed_spend(&owner, &KeyPair::generate(), &[&source, &source]);
        let prev_txs = prev_map(&[&source]);
        assert!(doubled.verify(&prev_txs).unwrap());

        match doubled.value_balance(&prev_txs) {
            Err(TransactionError::DuplicateInput { txid, vout }) => {
                assert_eq!(txid, hex::encode(&source.id));
                assert_eq!(vout, 0);
            }
            other => panic!("expected duplicate input, got {:?}", other),
        }
    }

    #[test]
    fn test_encoding_round_trip() {
        let owner = KeyPair::generate();
        let source = funding(&owner, 10);
        let spend = signed_spend(&owner, &KeyPair::generate(), &[&source]);

        let decoded = Transaction::from_bytes(&spend.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, spend);

        // Empty byte fields survive as empty
        let empty = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput::new(Vec::new(), 0, Vec::new())],
            outputs: vec![TxOutput::new(0, Vec::new())],
        };
        assert_eq!(Transaction::from_bytes(&empty.to_bytes().unwrap()).unwrap(), empty);

        let mut outputs = TxOutputs::from_outputs(&spend.outputs);
        outputs.spend(0);
        let decoded = TxOutputs::from_bytes(&outputs.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, outputs);
        assert_eq!(decoded.outputs.keys().copied().collect::<Vec<_>>(), vec![1]);

        assert!(Transaction::from_bytes(&[0xff, 0x01]).is_err());
    }
}
