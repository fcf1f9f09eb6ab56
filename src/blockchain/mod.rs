// Blockchain module
//
// This module contains the core ledger implementation including:
// - Block structure and canonical hashing
// - Transaction structure
// - Pending transaction pool
// - Proof of work algorithm
// - Ledger (the chain itself)
// - Peer registry
// - Consensus resolution

pub mod block;
pub mod canonical;
pub mod chain;
pub mod consensus;
pub mod peers;
pub mod pool;
pub mod proof;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{ChainValidationError, Ledger, LedgerError};
pub use consensus::{
    ChainFetcher, ConsensusResolver, ConsensusStrategy, FetchError, LongestValidChain,
    ResolutionOutcome, ResolutionState,
};
pub use peers::{PeerError, PeerRegistry};
pub use pool::TransactionPool;
pub use proof::ProofOfWork;
pub use transaction::{Transaction, TransactionError};
