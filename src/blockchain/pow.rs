use log::{debug, info};
use sha2::{Digest, Sha256};

use super::block::{Block, BlockError};

/// Difficulty used when none is configured
pub const DEFAULT_DIFFICULTY_BITS: u32 = 24;

/// Nonces are searched in `0..MAX_NONCE`
pub const MAX_NONCE: u64 = i64::MAX as u64;

/// Numeric target for a difficulty: `1 << (256 - difficulty_bits)` as a
/// big-endian 256-bit integer. `difficulty_bits` must be in `1..=256`.
pub fn target_for(difficulty_bits: u32) -> Result<[u8; 32], BlockError> {
    if !(1..=256).contains(&difficulty_bits) {
        return Err(BlockError::InvalidDifficulty(difficulty_bits));
    }

    let shift = (256 - difficulty_bits) as usize;
    let mut target = [0u8; 32];
    target[31 - shift / 8] = 1 << (shift % 8);

    Ok(target)
}

/// Whether `hash`, read as a big-endian integer, is strictly below `target`
pub fn meets_target(hash: &[u8], target: &[u8; 32]) -> bool {
    hash.len() == target.len() && hash < target.as_slice()
}

/// Seals and validates a block's nonce
#[derive(Debug)]
pub struct ProofOfWork<'a> {
    block: &'a Block,
    difficulty_bits: u32,
    target: [u8; 32],
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block, difficulty_bits: u32) -> Result<Self, BlockError> {
        let target = target_for(difficulty_bits)?;

        Ok(ProofOfWork {
            block,
            difficulty_bits,
            target,
        })
    }

    /// Sealing payload for a candidate nonce
    fn prepare_data(&self, commitment: &[u8], nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.block.prev_block_hash.len() + commitment.len() + 48);
        data.extend_from_slice(&self.block.prev_block_hash);
        data.extend_from_slice(commitment);
        data.extend_from_slice(format!("{:x}", self.block.timestamp).as_bytes());
        data.extend_from_slice(format!("{:x}", i64::from(self.difficulty_bits)).as_bytes());
        data.extend_from_slice(format!("{:x}", nonce).as_bytes());
        data
    }

    /// Searches nonces from zero upward for the first one whose hash is
    /// below the target. Blocks until found; there is no cancellation.
    pub fn run(&self) -> Result<(u64, Vec<u8>), BlockError> {
        let commitment = self.block.hash_transactions()?;

        info!(
            "Mining block with {} transactions at difficulty {}",
            self.block.transactions.len(),
            self.difficulty_bits
        );

        for nonce in 0..MAX_NONCE {
            let hash = Sha256::digest(self.prepare_data(&commitment, nonce));

            if meets_target(&hash, &self.target) {
                info!("Found nonce {} with hash {}", nonce, hex::encode(&hash));
                return Ok((nonce, hash.to_vec()));
            }
        }

        Err(BlockError::NonceExhausted)
    }

    /// Recomputes the hash for the block's stored nonce and checks it
    pub fn validate(&self) -> Result<bool, BlockError> {
        let commitment = self.block.hash_transactions()?;
        let hash = Sha256::digest(self.prepare_data(&commitment, self.block.nonce));

        let valid = meets_target(&hash, &self.target);
        if !valid {
            debug!("Block {} fails proof of work", hex::encode(&self.block.hash));
        }

        Ok(valid)
    }

    /// Hash of the sealing payload for the block's stored nonce
    pub fn compute_hash(&self) -> Result<Vec<u8>, BlockError> {
        let commitment = self.block.hash_transactions()?;
        Ok(Sha256::digest(self.prepare_data(&commitment, self.block.nonce)).to_vec())
    }
}
