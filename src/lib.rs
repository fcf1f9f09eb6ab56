// Ledger node library
//
// The core ledger and consensus engine: blocks, the pending transaction
// pool, proof of work, the ledger itself, the peer registry and the
// longest-valid-chain resolver. `Node` ties them together for a transport.

pub mod blockchain;
pub mod config;
pub mod node;

pub use config::NodeConfig;
pub use node::Node;
