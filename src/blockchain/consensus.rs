//! Conflict resolution between the local chain and chains held by peers.
//!
//! A `ConsensusStrategy` picks the winning candidate; the default is the
//! longest-valid-chain rule. `ConsensusResolver` runs one evaluation cycle
//! at a time and swaps the winner into the ledger in a single step.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use super::block::Block;
use super::chain::Ledger;

/// Peers are identified by their normalized `host:port`
pub type PeerId = String;

/// Transport failures while fetching a peer's chain
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Supplies peer chains to the resolver; implemented by the transport
#[async_trait]
pub trait ChainFetcher: Send + Sync {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, FetchError>;
}

/// Result of one resolution cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "length", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// The local chain was replaced by one of this length
    Replaced(usize),

    /// The local chain stays authoritative
    Unchanged,
}

impl ResolutionOutcome {
    pub fn is_replaced(&self) -> bool {
        matches!(self, ResolutionOutcome::Replaced(_))
    }
}

/// Phases of a resolution cycle
///
/// `Stable -> Evaluating -> Replaced | Rejected -> Stable`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    Stable,
    Evaluating,
    Replaced,
    Rejected,
}

/// Chooses which candidate chain, if any, should replace the local one
pub trait ConsensusStrategy: Send + Sync + fmt::Debug {
    /// Name of the strategy (for logging)
    fn name(&self) -> &str;

    /// Returns the peer whose chain should be adopted
    fn select(&self, local: &Ledger, candidates: &BTreeMap<PeerId, Vec<Block>>) -> Option<PeerId>;
}

/// Adopt the longest chain that passes validation, but only if it is
/// strictly longer than the local one. Ties keep the local chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct LongestValidChain;

impl ConsensusStrategy for LongestValidChain {
    fn name(&self) -> &str {
        "longest-valid-chain"
    }

    fn select(&self, local: &Ledger, candidates: &BTreeMap<PeerId, Vec<Block>>) -> Option<PeerId> {
        let mut best_length = local.length();
        let mut best = None;

        for (peer, chain) in candidates {
            if chain.len() <= best_length {
                debug!(
                    "Skipping chain of length {} from {} (best so far {})",
                    chain.len(),
                    peer,
                    best_length
                );
                continue;
            }

            match local.check_chain(chain) {
                Ok(()) => {
                    best_length = chain.len();
                    best = Some(peer.clone());
                }
                Err(err) => warn!("Rejecting chain of length {} from {}: {}", chain.len(), peer, err),
            }
        }

        best
    }
}

/// Runs resolution cycles against a ledger
#[derive(Debug)]
pub struct ConsensusResolver {
    strategy: Box<dyn ConsensusStrategy>,

    /// Held for the duration of a cycle
    cycle: Mutex<()>,

    state: Mutex<ResolutionState>,
}

impl Default for ConsensusResolver {
    fn default() -> Self {
        Self::new(Box::new(LongestValidChain))
    }
}

impl ConsensusResolver {
    pub fn new(strategy: Box<dyn ConsensusStrategy>) -> Self {
        ConsensusResolver {
            strategy,
            cycle: Mutex::new(()),
            state: Mutex::new(ResolutionState::Stable),
        }
    }

    pub fn strategy(&self) -> &dyn ConsensusStrategy {
        self.strategy.as_ref()
    }

    pub fn state(&self) -> ResolutionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the local ledger against already fetched candidate chains
    ///
    /// Invalid or short candidates are skipped without aborting the scan.
    /// Peers that could not be reached should simply be absent.
    ///
    /// # Arguments
    ///
    /// * `local` - The ledger to (maybe) replace
    /// * `candidates` - Chains keyed by peer
    ///
    /// # Returns
    ///
    /// `Replaced(length)` if a candidate was adopted, `Unchanged` otherwise
    pub fn resolve(
        &self,
        local: &Ledger,
        mut candidates: BTreeMap<PeerId, Vec<Block>>,
    ) -> ResolutionOutcome {
        let _cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        self.transition(ResolutionState::Evaluating);

        let winner = self
            .strategy
            .select(local, &candidates)
            .and_then(|peer| candidates.remove(&peer).map(|chain| (peer, chain)));

        let outcome = match winner {
            Some((peer, chain)) => {
                let length = chain.len();
                if local.adopt_if_longer(chain) {
                    info!(
                        "Chain from {} adopted by {} (length {})",
                        peer,
                        self.strategy.name(),
                        length
                    );
                    self.transition(ResolutionState::Replaced);
                    ResolutionOutcome::Replaced(length)
                } else {
                    self.transition(ResolutionState::Rejected);
                    ResolutionOutcome::Unchanged
                }
            }
            None => {
                self.transition(ResolutionState::Rejected);
                ResolutionOutcome::Unchanged
            }
        };

        self.transition(ResolutionState::Stable);
        outcome
    }

    fn transition(&self, next: ResolutionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("Resolution state {:?} -> {:?}", *state, next);
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{ProofOfWork, Transaction};

    fn engine() -> ProofOfWork {
        ProofOfWork::new(2).unwrap()
    }

    fn grow(ledger: &Ledger, blocks: usize) {
        for i in 0..blocks {
            ledger
                .add_transaction(Transaction::new("A", "B", i as f64).unwrap())
                .unwrap();
            let proof = ledger.engine().find_proof(ledger.tip().unwrap().proof);
            ledger.append_block(proof, None).unwrap();
        }
    }

    /// A ledger sharing `base`'s genesis, grown to `length` blocks
    fn fork(base: &Ledger, length: usize) -> Vec<Block> {
        let genesis = base.chain()[..1].to_vec();
        let ledger = Ledger::from_chain(engine(), genesis).unwrap();
        grow(&ledger, length - 1);
        ledger.chain()
    }

    fn candidates(chains: Vec<(&str, Vec<Block>)>) -> BTreeMap<PeerId, Vec<Block>> {
        chains
            .into_iter()
            .map(|(peer, chain)| (peer.to_string(), chain))
            .collect()
    }

    #[test]
    fn test_longest_valid_chain_wins_over_longer_invalid() {
        let local = Ledger::new(engine());
        grow(&local, 2);
        let valid = fork(&local, 5);
        let mut invalid = fork(&local, 7);
        invalid[3].transactions.push(Transaction::new("X", "Y", 1.0).unwrap());

        let resolver = ConsensusResolver::default();
        let outcome = resolver.resolve(
            &local,
            candidates(vec![("a:1", invalid), ("b:1", valid.clone())]),
        );

        assert_eq!(outcome, ResolutionOutcome::Replaced(5));
        assert_eq!(local.chain(), valid);
        assert_eq!(resolver.state(), ResolutionState::Stable);
    }

    #[test]
    fn test_tie_keeps_local_chain() {
        let local = Ledger::new(engine());
        grow(&local, 3);
        let before = local.chain();
        let rival = fork(&local, 4);

        let outcome = ConsensusResolver::default().resolve(&local, candidates(vec![("a:1", rival)]));

        assert_eq!(outcome, ResolutionOutcome::Unchanged);
        assert_eq!(local.chain(), before);
    }

    #[test]
    fn test_shorter_and_empty_candidates_ignored() {
        let local = Ledger::new(engine());
        grow(&local, 2);
        let shorter = fork(&local, 2);

        let resolver = ConsensusResolver::default();
        assert_eq!(
            resolver.resolve(&local, candidates(vec![("a:1", shorter), ("b:1", Vec::new())])),
            ResolutionOutcome::Unchanged
        );
        assert_eq!(resolver.resolve(&local, BTreeMap::new()), ResolutionOutcome::Unchanged);
        assert_eq!(local.length(), 3);
    }

    #[test]
    fn test_only_invalid_longer_candidate_rejected() {
        let local = Ledger::new(engine());
        let before = local.chain();
        let mut forged = fork(&local, 4);
        forged[2].previous_hash = "0".repeat(64);

        let outcome = ConsensusResolver::default().resolve(&local, candidates(vec![("a:1", forged)]));

        assert_eq!(outcome, ResolutionOutcome::Unchanged);
        assert_eq!(local.chain(), before);
    }

    #[test]
    fn test_longest_of_several_valid_candidates() {
        let local = Ledger::new(engine());
        let five = fork(&local, 5);
        let six = fork(&local, 6);

        let outcome = ConsensusResolver::default().resolve(
            &local,
            candidates(vec![("z:1", five), ("a:1", six.clone())]),
        );

        assert_eq!(outcome, ResolutionOutcome::Replaced(6));
        assert_eq!(local.tip().unwrap(), *six.last().unwrap());
    }

    #[derive(Debug)]
    struct NeverSwitch;

    impl ConsensusStrategy for NeverSwitch {
        fn name(&self) -> &str {
            "never-switch"
        }

        fn select(&self, _local: &Ledger, _candidates: &BTreeMap<PeerId, Vec<Block>>) -> Option<PeerId> {
            None
        }
    }

    #[test]
    fn test_pluggable_strategy() {
        let local = Ledger::new(engine());
        let longer = fork(&local, 3);

        let resolver = ConsensusResolver::new(Box::new(NeverSwitch));
        assert_eq!(resolver.strategy().name(), "never-switch");
        assert_eq!(
            resolver.resolve(&local, candidates(vec![("a:1", longer)])),
            ResolutionOutcome::Unchanged
        );
        assert_eq!(local.length(), 1);
    }

    #[test]
    fn test_outcome_serialization() {
        assert_eq!(
            serde_json::to_value(ResolutionOutcome::Replaced(5)).unwrap(),
            serde_json::json!({ "outcome": "replaced", "length": 5 })
        );
        assert_eq!(
            serde_json::to_value(ResolutionOutcome::Unchanged).unwrap(),
            serde_json::json!({ "outcome": "unchanged" })
        );
    }
}
