use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::blockchain::proof::{ProofOfWork, DEFAULT_DIFFICULTY};

const HOST_KEY: &str = "LEDGER_HOST";
const PORT_KEY: &str = "LEDGER_PORT";
const DIFFICULTY_KEY: &str = "LEDGER_DIFFICULTY";
const NODE_ID_KEY: &str = "LEDGER_NODE_ID";
pub(crate) const PEERS_KEY: &str = "LEDGER_PEERS";
const SYNC_INTERVAL_KEY: &str = "LEDGER_SYNC_INTERVAL_SECS";
const FETCH_TIMEOUT_KEY: &str = "LEDGER_FETCH_TIMEOUT_MS";
const MAX_CHAIN_BYTES_KEY: &str = "LEDGER_MAX_CHAIN_BYTES";

const DEFAULT_MAX_CHAIN_BYTES: usize = 16 * 1024 * 1024;

/// Errors raised while loading configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Settings for a ledger node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Interface the HTTP adapter binds to
    pub host: String,

    /// Port the HTTP adapter binds to
    pub port: u16,

    /// Leading zero hex characters required of every proof
    pub difficulty: usize,

    /// Identifier of this node, for logs and peers
    pub node_id: String,

    /// Peers registered at startup
    pub peers: Vec<String>,

    /// Period of background conflict resolution; None disables it
    pub sync_interval: Option<Duration>,

    /// Upper bound for fetching one peer's chain
    pub fetch_timeout: Duration,

    /// Largest peer response accepted, headers included
    pub max_chain_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: "127.0.0.1".to_string(),
            port: 5000,
            difficulty: DEFAULT_DIFFICULTY,
            node_id: Uuid::new_v4().simple().to_string(),
            peers: Vec::new(),
            sync_interval: Some(Duration::from_secs(10)),
            fetch_timeout: Duration::from_secs(5),
            max_chain_bytes: DEFAULT_MAX_CHAIN_BYTES,
        }
    }
}

impl NodeConfig {
    /// Loads the configuration from the environment, reading `.env` first
    /// if present
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup, falling back to
    /// the defaults for missing keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = NodeConfig::default();

        if let Some(host) = lookup(HOST_KEY) {
            config.host = host;
        }
        if let Some(port) = lookup(PORT_KEY) {
            config.port = parse(PORT_KEY, &port)?;
        }
        if let Some(difficulty) = lookup(DIFFICULTY_KEY) {
            config.difficulty = parse(DIFFICULTY_KEY, &difficulty)?;
            config.proof_of_work()?;
        }
        if let Some(node_id) = lookup(NODE_ID_KEY) {
            config.node_id = node_id;
        }
        if let Some(peers) = lookup(PEERS_KEY) {
            config.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(interval) = lookup(SYNC_INTERVAL_KEY) {
            let secs: u64 = parse(SYNC_INTERVAL_KEY, &interval)?;
            config.sync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(timeout) = lookup(FETCH_TIMEOUT_KEY) {
            config.fetch_timeout = Duration::from_millis(parse(FETCH_TIMEOUT_KEY, &timeout)?);
        }
        if let Some(limit) = lookup(MAX_CHAIN_BYTES_KEY) {
            config.max_chain_bytes = parse(MAX_CHAIN_BYTES_KEY, &limit)?;
            if config.max_chain_bytes == 0 {
                return Err(ConfigError::Invalid {
                    key: MAX_CHAIN_BYTES_KEY,
                    value: limit,
                });
            }
        }

        Ok(config)
    }

    /// The work function for this node's difficulty
    pub fn proof_of_work(&self) -> Result<ProofOfWork, ConfigError> {
        ProofOfWork::new(self.difficulty).map_err(|_| ConfigError::Invalid {
            key: DIFFICULTY_KEY,
            value: self.difficulty.to_string(),
        })
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
