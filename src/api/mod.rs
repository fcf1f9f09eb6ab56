// API module
//
// HTTP adapter around the ledger node: the routes clients and peers call,
// and the client used to fetch peer chains.

pub mod handlers;
pub mod peer_client;
pub mod routes;

// Re-export main components for easier access
pub use peer_client::HttpChainFetcher;
pub use routes::configure_routes;
