use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use log::{info, warn};

use crate::blockchain::consensus::PeerId;
use crate::blockchain::{
    Block, ChainFetcher, ConsensusResolver, Ledger, LedgerError, PeerError, PeerRegistry,
    ResolutionOutcome, ResolutionState, Transaction,
};
use crate::config::{ConfigError, NodeConfig, PEERS_KEY};

/// The operations a transport exposes to clients and peers
///
/// Owns the ledger, the peer registry and the resolver, and makes sure a
/// proof search never outlives the tip it was started for.
#[derive(Debug)]
pub struct Node {
    node_id: String,
    ledger: Ledger,
    peers: PeerRegistry,
    resolver: ConsensusResolver,

    /// One proof search at a time
    mining: tokio::sync::Mutex<()>,

    /// Cancellation flag of the running proof search
    in_flight: Mutex<Option<Arc<AtomicBool>>>,
}

/// Stops the search and clears the in-flight slot when `mine` finishes or
/// its future is dropped
struct SearchGuard<'a> {
    node: &'a Node,
    flag: Arc<AtomicBool>,
}

impl Drop for SearchGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::Relaxed);
        self.node.in_flight_slot().take();
    }
}

impl Node {
    /// Creates a node with a fresh ledger and the configured peers
    pub fn new(config: &NodeConfig) -> Result<Self, ConfigError> {
        let node = Node::with_parts(
            config.node_id.clone(),
            Ledger::new(config.proof_of_work()?),
            ConsensusResolver::default(),
        );

        for peer in &config.peers {
            node.register_peer(peer).map_err(|_| ConfigError::Invalid {
                key: PEERS_KEY,
                value: peer.clone(),
            })?;
        }

        Ok(node)
    }

    /// Creates a node around an existing ledger and resolver
    pub fn with_parts(node_id: impl Into<String>, ledger: Ledger, resolver: ConsensusResolver) -> Self {
        Node {
            node_id: node_id.into(),
            ledger,
            peers: PeerRegistry::new(),
            resolver,
            mining: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Queues a transaction for the next block
    ///
    /// # Returns
    ///
    /// The index of the block that would include it
    pub fn submit_transaction(&self, sender: &str, recipient: &str, amount: f64) -> Result<u64, LedgerError> {
        let transaction = Transaction::new(sender, recipient, amount)?;
        self.ledger.add_transaction(transaction)
    }

    /// Mines a block holding every pending transaction
    ///
    /// The proof search runs on the blocking pool. It is abandoned with
    /// `MiningCancelled` when `cancel_mining` is called or the chain gets
    /// replaced, and a result that no longer matches the tip is refused
    /// with `StaleTip`.
    pub async fn mine(&self) -> Result<Block, LedgerError> {
        let _miner = self.mining.lock().await;

        let tip = self.ledger.tip()?;
        let tip_hash = tip.content_hash();
        let previous_proof = tip.proof;
        let engine = *self.ledger.engine();

        let cancel = Arc::new(AtomicBool::new(false));
        *self.in_flight_slot() = Some(Arc::clone(&cancel));
        let guard = SearchGuard {
            node: self,
            flag: Arc::clone(&cancel),
        };

        let search =
            tokio::task::spawn_blocking(move || engine.find_proof_cancellable(previous_proof, &cancel))
                .await;
        drop(guard);

        let proof = search
            .map_err(|err| LedgerError::Worker(err.to_string()))?
            .ok_or(LedgerError::MiningCancelled)?;

        let block = self.ledger.append_mined(proof, &tip_hash)?;
        info!("Node {} mined block {} (proof {})", self.node_id, block.index, block.proof);
        Ok(block)
    }

    /// Stops the running proof search, if any
    ///
    /// # Returns
    ///
    /// true if a search was running
    pub fn cancel_mining(&self) -> bool {
        match self.in_flight_slot().as_ref() {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn is_mining(&self) -> bool {
        self.in_flight_slot().is_some()
    }

    pub fn get_chain(&self) -> Vec<Block> {
        self.ledger.chain()
    }

    pub fn get_chain_length(&self) -> usize {
        self.ledger.length()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.ledger.pool().pending()
    }

    /// Registers a peer by URL or `host:port`
    ///
    /// # Returns
    ///
    /// true if the peer was new
    pub fn register_peer(&self, address: &str) -> Result<bool, PeerError> {
        let added = self.peers.register(address)?;
        if added {
            info!("Node {} registered peer {}", self.node_id, address);
        }
        Ok(added)
    }

    pub fn peers(&self) -> BTreeSet<String> {
        self.peers.peers()
    }

    pub fn resolution_state(&self) -> ResolutionState {
        self.resolver.state()
    }

    /// Fetches every registered peer's chain and resolves against them
    ///
    /// Peers that fail to answer are left out of the comparison. Validating
    /// the candidates runs on the blocking pool so it does not hold up the
    /// caller's executor.
    pub async fn resolve_conflicts<F>(self: Arc<Self>, fetcher: &F) -> ResolutionOutcome
    where
        F: ChainFetcher + ?Sized,
    {
        let fetches = self.peers.peers().into_iter().map(|peer| async move {
            let result = fetcher.fetch_chain(&peer).await;
            (peer, result)
        });

        let mut candidates = BTreeMap::new();
        for (peer, result) in join_all(fetches).await {
            match result {
                Ok(chain) => {
                    candidates.insert(peer, chain);
                }
                Err(err) => warn!("Skipping peer {}: {}", peer, err),
            }
        }

        let node = Arc::clone(&self);
        tokio::task::spawn_blocking(move || node.resolve_with(candidates))
            .await
            .unwrap_or_else(|err| {
                warn!("Node {} resolution worker failed: {}", self.node_id, err);
                ResolutionOutcome::Unchanged
            })
    }

    /// Resolves against chains the transport has already fetched
    pub fn resolve_with(&self, candidates: BTreeMap<PeerId, Vec<Block>>) -> ResolutionOutcome {
        let outcome = self.resolver.resolve(&self.ledger, candidates);

        if outcome.is_replaced() && self.cancel_mining() {
            info!("Node {} abandoned a proof search for a replaced tip", self.node_id);
        }
        outcome
    }

    fn in_flight_slot(&self) -> MutexGuard<'_, Option<Arc<AtomicBool>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::consensus::{ConsensusStrategy, FetchError};
    use crate::blockchain::ProofOfWork;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::thread::{self, ThreadId};
    use std::time::Duration;

    fn node(difficulty: usize) -> Node {
        let config = NodeConfig {
            difficulty,
            node_id: "test".to_string(),
            ..NodeConfig::default()
        };
        Node::new(&config).unwrap()
    }

    /// Serves fixed chains; unknown peers are unreachable
    struct StaticFetcher(HashMap<String, Vec<Block>>);

    #[async_trait]
    impl ChainFetcher for StaticFetcher {
        async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, FetchError> {
            self.0.get(peer).cloned().ok_or_else(|| {
                FetchError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, peer.to_string()))
            })
        }
    }

    /// Picks any longer candidate without checking it
    #[derive(Debug)]
    struct TakeLongest;

    impl ConsensusStrategy for TakeLongest {
        fn name(&self) -> &str {
            "take-longest"
        }

        fn select(&self, local: &Ledger, candidates: &BTreeMap<PeerId, Vec<Block>>) -> Option<PeerId> {
            candidates
                .iter()
                .filter(|(_, chain)| chain.len() > local.length())
                .max_by_key(|(_, chain)| chain.len())
                .map(|(peer, _)| peer.clone())
        }
    }

    async fn wait_until_mining(node: &Node) {
        while !node.is_mining() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_and_mine() {
        let node = node(2);

        assert_eq!(node.submit_transaction("A", "B", 10.0).unwrap(), 1);
        assert_eq!(node.pending_transactions().len(), 1);

        let block = node.mine().await.unwrap();

        assert_eq!(block.index, 1);
        assert_eq!(block.transactions.len(), 1);
        assert!(node.pending_transactions().is_empty());
        assert_eq!(node.get_chain_length(), 2);
        assert!(!node.is_mining());
        assert!(node.ledger().is_valid());
    }

    #[tokio::test]
    async fn test_mine_with_empty_pool() {
        let node = node(2);

        let block = node.mine().await.unwrap();

        assert_eq!(block.index, 1);
        assert!(block.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_blank_sender() {
        let node = node(2);

        assert!(matches!(
            node.submit_transaction("", "B", 1.0),
            Err(LedgerError::Transaction(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_mining() {
        let node = Arc::new(node(64));
        assert!(!node.cancel_mining());

        let miner = tokio::spawn({
            let node = Arc::clone(&node);
            async move { node.mine().await }
        });
        wait_until_mining(&node).await;

        assert!(node.cancel_mining());
        let result = miner.await.unwrap();

        assert!(matches!(result, Err(LedgerError::MiningCancelled)));
        assert_eq!(node.get_chain_length(), 1);
    }

    #[tokio::test]
    async fn test_replacement_aborts_search() {
        let engine = ProofOfWork::new(64).unwrap();
        let node = Arc::new(Node::with_parts(
            "test",
            Ledger::new(engine),
            ConsensusResolver::new(Box::new(TakeLongest)),
        ));
        node.submit_transaction("A", "B", 1.0).unwrap();

        let miner = tokio::spawn({
            let node = Arc::clone(&node);
            async move { node.mine().await }
        });
        wait_until_mining(&node).await;

        let mut longer = node.get_chain();
        longer.push(Block::new(1, longer[0].content_hash(), Vec::new(), 0, 0.0));
        let outcome = node.resolve_with(BTreeMap::from([("peer:1".to_string(), longer.clone())]));

        assert_eq!(outcome, ResolutionOutcome::Replaced(2));
        assert!(matches!(miner.await.unwrap(), Err(LedgerError::MiningCancelled)));
        assert_eq!(node.get_chain(), longer);
        // The abandoned search never drained the pool
        assert_eq!(node.pending_transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_mine_future_stops_search() {
        let node = node(64);

        let result = tokio::time::timeout(Duration::from_millis(20), node.mine()).await;

        assert!(result.is_err());
        assert!(!node.is_mining());
        assert_eq!(node.get_chain_length(), 1);
        // The mining lock was released with the future
        assert!(node.mining.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_register_peer() {
        let node = node(2);

        assert!(node.register_peer("http://127.0.0.1:5001").unwrap());
        assert!(!node.register_peer("127.0.0.1:5001").unwrap());
        assert!(node.register_peer("").is_err());
        assert_eq!(node.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_conflicts_skips_unreachable_peers() {
        let local = Arc::new(node(2));
        local.register_peer("http://good:1").unwrap();
        local.register_peer("http://down:1").unwrap();

        let remote = Node::with_parts(
            "remote",
            Ledger::from_chain(*local.ledger().engine(), local.get_chain()).unwrap(),
            ConsensusResolver::default(),
        );
        remote.submit_transaction("A", "B", 3.0).unwrap();
        remote.mine().await.unwrap();
        remote.mine().await.unwrap();

        let fetcher = StaticFetcher(HashMap::from([("good:1".to_string(), remote.get_chain())]));
        let outcome = Arc::clone(&local).resolve_conflicts(&fetcher).await;

        assert_eq!(outcome, ResolutionOutcome::Replaced(3));
        assert_eq!(local.get_chain(), remote.get_chain());
        assert_eq!(local.resolution_state(), ResolutionState::Stable);
    }

    #[tokio::test]
    async fn test_resolve_conflicts_without_peers() {
        let node = Arc::new(node(2));
        let fetcher = StaticFetcher(HashMap::new());

        assert_eq!(node.resolve_conflicts(&fetcher).await, ResolutionOutcome::Unchanged);
    }

    /// Records the thread that evaluated the candidates
    #[derive(Debug)]
    struct RecordThread(Arc<Mutex<Option<ThreadId>>>);

    impl ConsensusStrategy for RecordThread {
        fn name(&self) -> &str {
            "record-thread"
        }

        fn select(&self, _local: &Ledger, _candidates: &BTreeMap<PeerId, Vec<Block>>) -> Option<PeerId> {
            *self.0.lock().unwrap() = Some(thread::current().id());
            None
        }
    }

    #[tokio::test]
    async fn test_resolve_conflicts_validates_off_the_executor() {
        let seen = Arc::new(Mutex::new(None));
        let node = Arc::new(Node::with_parts(
            "test",
            Ledger::new(ProofOfWork::new(2).unwrap()),
            ConsensusResolver::new(Box::new(RecordThread(Arc::clone(&seen)))),
        ));
        node.register_peer("peer:1").unwrap();
        let fetcher = StaticFetcher(HashMap::from([("peer:1".to_string(), node.get_chain())]));

        let outcome = Arc::clone(&node).resolve_conflicts(&fetcher).await;

        assert_eq!(outcome, ResolutionOutcome::Unchanged);
        let evaluated_on = seen.lock().unwrap().expect("strategy was consulted");
        assert_ne!(evaluated_on, thread::current().id());
    }

    #[test]
    fn test_new_rejects_bad_peer() {
        let config = NodeConfig {
            peers: vec!["http://".to_string()],
            ..NodeConfig::default()
        };

        assert!(matches!(Node::new(&config), Err(ConfigError::Invalid { key: "LEDGER_PEERS", .. })));
    }
}
