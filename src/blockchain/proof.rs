use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Leading zero hex characters required by default
pub const DEFAULT_DIFFICULTY: usize = 4;

/// A SHA-256 digest has 64 hex characters
pub const MAX_DIFFICULTY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Difficulty must be between 1 and {MAX_DIFFICULTY}, got {0}")]
pub struct InvalidDifficulty(pub usize);

/// The work function linking consecutive blocks
///
/// A proof `q` is valid after proof `p` when the lowercase hex SHA-256 of the
/// decimal text `"{p}{q}"` starts with `difficulty` zero characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty: usize,
}

impl Default for ProofOfWork {
    fn default() -> Self {
        ProofOfWork {
            difficulty: DEFAULT_DIFFICULTY,
        }
    }
}

impl ProofOfWork {
    /// Creates an engine with a fixed difficulty
    pub fn new(difficulty: usize) -> Result<Self, InvalidDifficulty> {
        if difficulty == 0 || difficulty > MAX_DIFFICULTY {
            return Err(InvalidDifficulty(difficulty));
        }

        Ok(ProofOfWork { difficulty })
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Hex digest of the proof pair, as checked by `is_valid`
    pub fn guess_hash(previous_proof: u64, proof: u64) -> String {
        hex::encode(Self::digest(previous_proof, proof))
    }

    /// Validates a claimed proof without searching
    ///
    /// # Arguments
    ///
    /// * `previous_proof` - Proof of the preceding block
    /// * `proof` - The candidate proof
    ///
    /// # Returns
    ///
    /// true if the pair's digest has the required zero prefix
    pub fn is_valid(&self, previous_proof: u64, proof: u64) -> bool {
        let digest = Self::digest(previous_proof, proof);

        // Each byte holds two hex characters, high nibble first
        (0..self.difficulty).all(|i| {
            let byte = digest[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            nibble == 0
        })
    }

    /// Finds the smallest non-negative proof valid after `previous_proof`
    ///
    /// Runs until a proof is found. Use `find_proof_cancellable` anywhere
    /// the search must be stoppable.
    pub fn find_proof(&self, previous_proof: u64) -> u64 {
        let mut proof = 0;
        while !self.is_valid(previous_proof, proof) {
            proof += 1;
        }
        proof
    }

    /// Same search as `find_proof`, checking `cancel` before every attempt
    ///
    /// # Returns
    ///
    /// The proof, or None once `cancel` has been raised
    pub fn find_proof_cancellable(&self, previous_proof: u64, cancel: &AtomicBool) -> Option<u64> {
        let mut proof = 0;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }

            if self.is_valid(previous_proof, proof) {
                return Some(proof);
            }

            proof += 1;
        }
    }

    fn digest(previous_proof: u64, proof: u64) -> [u8; 32] {
        let guess = format!("{}{}", previous_proof, proof);
        Sha256::digest(guess.as_bytes()).into()
    }
}
