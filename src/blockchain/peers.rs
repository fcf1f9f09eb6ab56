use std::collections::BTreeSet;

use dashmap::DashSet;
use log::debug;
use thiserror::Error;

/// Errors that can occur when registering a peer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("Invalid peer address: {0:?}")]
    InvalidAddress(String),
}

/// The set of known peers, stored as `host:port`
///
/// Pure bookkeeping: nothing here talks to the network, and entries are
/// never expired.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashSet<String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer
    ///
    /// # Arguments
    ///
    /// * `address` - A URL such as `http://192.168.0.5:5000/` or a bare
    ///   `host:port`
    ///
    /// # Returns
    ///
    /// true if the peer was not known before
    pub fn register(&self, address: &str) -> Result<bool, PeerError> {
        let normalized = normalize(address)?;
        let inserted = self.peers.insert(normalized.clone());

        if inserted {
            debug!("Registered peer {}", normalized);
        }
        Ok(inserted)
    }

    /// Gets a sorted snapshot of the known peers
    pub fn peers(&self) -> BTreeSet<String> {
        self.peers.iter().map(|peer| peer.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Reduces an address to its lowercase `host[:port]` authority
pub fn normalize(address: &str) -> Result<String, PeerError> {
    let invalid = || PeerError::InvalidAddress(address.to_string());

    let trimmed = address.trim();
    let without_scheme = match trimmed.find("://") {
        Some(pos) => &trimmed[pos + 3..],
        None => trimmed.strip_prefix("//").unwrap_or(trimmed),
    };

    let authority = without_scheme
        .split(|c: char| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();

    if host_port.is_empty() || host_port.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    if let Some((host, port)) = split_port(host_port) {
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
    }

    Ok(host_port.to_ascii_lowercase())
}

/// Splits `host:port` into its parts; None when no port is present
///
/// IPv6 literals keep their colons inside brackets.
pub fn split_port(host_port: &str) -> Option<(&str, &str)> {
    let search_from = host_port.rfind(']').unwrap_or(0);
    host_port[search_from..]
        .rfind(':')
        .map(|pos| host_port.split_at(search_from + pos))
        .map(|(host, port)| (host, &port[1..]))
}
