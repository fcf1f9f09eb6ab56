use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};
use thiserror::Error;

use super::block::{self, Block};
use super::pool::TransactionPool;
use super::proof::ProofOfWork;
use super::transaction::{Transaction, TransactionError};

/// Reasons a block sequence fails validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainValidationError {
    #[error("Block {index} does not link to the hash of its predecessor")]
    BrokenLink { index: u64 },

    #[error("Block {index} carries a proof that fails the work check")]
    InvalidProof { index: u64 },

    #[error("Block at position {position} has index {found}")]
    IndexMismatch { position: usize, found: u64 },
}

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid proof {proof} after previous proof {previous_proof}")]
    InvalidProof { previous_proof: u64, proof: u64 },

    #[error("The chain has no blocks")]
    EmptyChain,

    #[error("Chain tip moved: expected {expected}, found {actual}")]
    StaleTip { expected: String, actual: String },

    #[error("Mining was cancelled")]
    MiningCancelled,

    #[error("Mining worker failed: {0}")]
    Worker(String),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Invalid chain: {0}")]
    InvalidChain(#[from] ChainValidationError),
}

/// The ordered block sequence plus the pool feeding it
///
/// All mutation goes through the write half of one lock, so readers never
/// observe a half-appended block or a partially replaced chain. The chain is
/// never empty after construction.
#[derive(Debug)]
pub struct Ledger {
    /// The chain of blocks
    chain: RwLock<Vec<Block>>,

    /// Pending transactions to be included in the next block
    pool: TransactionPool,

    /// Work function shared by appends and validation
    engine: ProofOfWork,
}

impl Ledger {
    /// Creates a new ledger with a genesis block
    pub fn new(engine: ProofOfWork) -> Self {
        Ledger {
            chain: RwLock::new(vec![Block::genesis()]),
            pool: TransactionPool::new(),
            engine,
        }
    }

    /// Creates a ledger from an existing chain, validating it first
    ///
    /// # Arguments
    ///
    /// * `engine` - The work function
    /// * `chain` - Blocks starting at the genesis block
    pub fn from_chain(engine: ProofOfWork, chain: Vec<Block>) -> Result<Self, LedgerError> {
        if chain.is_empty() {
            return Err(LedgerError::EmptyChain);
        }
        check_chain_with(&engine, &chain)?;

        Ok(Ledger {
            chain: RwLock::new(chain),
            pool: TransactionPool::new(),
            engine,
        })
    }

    pub fn engine(&self) -> &ProofOfWork {
        &self.engine
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    /// Adds a new transaction to the pending pool
    ///
    /// # Returns
    ///
    /// The index of the block that would include this transaction if it
    /// were mined now. Informational only.
    pub fn add_transaction(&self, transaction: Transaction) -> Result<u64, LedgerError> {
        transaction.validate()?;
        self.pool.add_transaction(transaction);

        Ok(self.tip()?.index + 1)
    }

    /// Gets the last block in the chain
    pub fn tip(&self) -> Result<Block, LedgerError> {
        self.read().last().cloned().ok_or(LedgerError::EmptyChain)
    }

    pub fn length(&self) -> usize {
        self.read().len()
    }

    /// Gets a copy of the entire chain
    pub fn chain(&self) -> Vec<Block> {
        self.read().clone()
    }

    /// Appends a block holding every pending transaction
    ///
    /// # Arguments
    ///
    /// * `proof` - A proof valid after the tip's proof
    /// * `previous_hash` - Hash of the tip; computed when omitted
    ///
    /// # Returns
    ///
    /// The appended block. On error nothing is appended and the pool is
    /// left untouched.
    pub fn append_block(&self, proof: u64, previous_hash: Option<String>) -> Result<Block, LedgerError> {
        let mut chain = self.write();
        self.push_block(&mut chain, proof, previous_hash)
    }

    /// Appends a mined block, provided the tip is still the one it was
    /// mined against
    pub fn append_mined(&self, proof: u64, expected_tip_hash: &str) -> Result<Block, LedgerError> {
        let mut chain = self.write();
        let actual = chain.last().ok_or(LedgerError::EmptyChain)?.content_hash();

        if actual != expected_tip_hash {
            return Err(LedgerError::StaleTip {
                expected: expected_tip_hash.to_string(),
                actual,
            });
        }

        self.push_block(&mut chain, proof, Some(actual))
    }

    fn push_block(
        &self,
        chain: &mut Vec<Block>,
        proof: u64,
        previous_hash: Option<String>,
    ) -> Result<Block, LedgerError> {
        let tip = chain.last().ok_or(LedgerError::EmptyChain)?;

        if !self.engine.is_valid(tip.proof, proof) {
            return Err(LedgerError::InvalidProof {
                previous_proof: tip.proof,
                proof,
            });
        }

        let tip_hash = tip.content_hash();
        let previous_hash = match previous_hash {
            Some(hash) if hash != tip_hash => {
                return Err(ChainValidationError::BrokenLink {
                    index: tip.index + 1,
                }
                .into())
            }
            _ => tip_hash,
        };

        let block = Block::new(
            tip.index + 1,
            previous_hash,
            self.pool.drain(),
            proof,
            block::now(),
        );
        chain.push(block.clone());

        info!(
            "Appended block {} with {} transactions",
            block.index,
            block.transactions.len()
        );
        Ok(block)
    }

    /// Validates a candidate chain against the linking and work rules
    ///
    /// An empty chain is trivially valid, and so is a lone block at index 0.
    pub fn validate_chain(&self, candidate: &[Block]) -> bool {
        self.check_chain(candidate).is_ok()
    }

    /// Like `validate_chain`, reporting the first violation
    pub fn check_chain(&self, candidate: &[Block]) -> Result<(), ChainValidationError> {
        check_chain_with(&self.engine, candidate)
    }

    /// Validates the ledger's own chain
    pub fn is_valid(&self) -> bool {
        self.validate_chain(&self.read())
    }

    /// Replaces the chain with a valid, strictly longer candidate
    ///
    /// # Returns
    ///
    /// true if the candidate was adopted
    pub fn replace_chain(&self, candidate: Vec<Block>) -> Result<bool, LedgerError> {
        self.check_chain(&candidate)?;
        Ok(self.adopt_if_longer(candidate))
    }

    /// Swaps in an already validated candidate if it is still strictly
    /// longer once the write lock is held
    pub(crate) fn adopt_if_longer(&self, candidate: Vec<Block>) -> bool {
        let mut chain = self.write();

        if candidate.len() <= chain.len() {
            debug!(
                "Candidate of length {} no longer beats local length {}",
                candidate.len(),
                chain.len()
            );
            return false;
        }

        info!(
            "Replacing chain of length {} with chain of length {}",
            chain.len(),
            candidate.len()
        );
        *chain = candidate;
        true
    }

    // Poisoning only means a panic elsewhere; the Vec itself is never left
    // half-written because blocks are pushed or swapped whole.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Block>> {
        self.chain.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Block>> {
        self.chain.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_chain_with(engine: &ProofOfWork, candidate: &[Block]) -> Result<(), ChainValidationError> {
    if let Some(first) = candidate.first() {
        if first.index != 0 {
            return Err(ChainValidationError::IndexMismatch {
                position: 0,
                found: first.index,
            });
        }
    }

    for (offset, pair) in candidate.windows(2).enumerate() {
        let (previous, block) = (&pair[0], &pair[1]);
        let position = offset + 1;

        if block.index != position as u64 {
            return Err(ChainValidationError::IndexMismatch {
                position,
                found: block.index,
            });
        }

        if block.previous_hash != previous.content_hash() {
            return Err(ChainValidationError::BrokenLink { index: block.index });
        }

        if !engine.is_valid(previous.proof, block.proof) {
            return Err(ChainValidationError::InvalidProof { index: block.index });
        }
    }

    Ok(())
}
