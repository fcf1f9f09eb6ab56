use actix_web::{web, HttpResponse, Responder};
use log::warn;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use ledger_node::blockchain::{Block, LedgerError, Transaction};
use ledger_node::Node;

use super::peer_client::HttpChainFetcher;

/// Data structure for the node state
pub type NodeData = web::Data<Node>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// The length of the chain
    pub length: usize,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sender's address
    pub sender: String,

    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: f64,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// The index of the block that will include this transaction
    pub block_index: u64,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: Block,

    /// The block's timestamp in RFC 3339 form
    pub mined_at: Option<String>,
}

/// Request for the node registration endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterNodesRequest {
    /// Peer URLs or `host:port` pairs
    pub nodes: Vec<String>,
}

/// Response for the node registration endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterNodesResponse {
    /// The message
    pub message: String,

    /// Every peer known after registration
    pub total_nodes: Vec<String>,
}

/// Response for the resolve endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ResolveResponse {
    /// The message
    pub message: String,

    /// Whether the local chain was replaced
    pub replaced: bool,

    /// The chain after resolution
    pub chain: Vec<Block>,
}

fn error_body(message: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "error": message.to_string() })
}

/// Get the full chain
///
/// Returns every block and the chain length. Peers call this during
/// conflict resolution.
#[utoipa::path(
    get,
    path = "/chain",
    responses(
        (status = 200, description = "Chain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(node: NodeData) -> impl Responder {
    let chain = node.get_chain();

    HttpResponse::Ok().json(ChainResponse {
        length: chain.len(),
        chain,
    })
}

/// Get all pending transactions
#[utoipa::path(
    get,
    path = "/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.pending_transactions())
}

/// Create a new transaction
///
/// Adds a new transaction to the pool of the next block
#[utoipa::path(
    post,
    path = "/transactions/new",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction queued", body = TransactionResponse),
        (status = 400, description = "Missing or invalid values")
    )
)]
pub async fn new_transaction(
    node: NodeData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    match node.submit_transaction(
        &transaction_req.sender,
        &transaction_req.recipient,
        transaction_req.amount,
    ) {
        Ok(block_index) => HttpResponse::Created().json(TransactionResponse {
            message: format!("Transaction will be added to Block {}", block_index),
            block_index,
        }),
        Err(err) => HttpResponse::BadRequest().json(error_body(err)),
    }
}

/// Mine a new block
///
/// Creates a new block with all pending transactions
#[utoipa::path(
    post,
    path = "/mine",
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 409, description = "The chain changed while mining"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(node: NodeData) -> impl Responder {
    match node.mine().await {
        Ok(block) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Forged".to_string(),
            mined_at: block.created_at().map(|time| time.to_rfc3339()),
            block,
        }),
        Err(err @ (LedgerError::MiningCancelled | LedgerError::StaleTip { .. })) => {
            HttpResponse::Conflict().json(error_body(err))
        }
        Err(err) => {
            warn!("Mining failed: {}", err);
            HttpResponse::InternalServerError().json(error_body(err))
        }
    }
}

/// Register peers
///
/// Adds peers used by conflict resolution
#[utoipa::path(
    post,
    path = "/nodes/register",
    request_body = RegisterNodesRequest,
    responses(
        (status = 201, description = "Peers registered", body = RegisterNodesResponse),
        (status = 400, description = "Empty list or invalid address")
    )
)]
pub async fn register_nodes(
    node: NodeData,
    register_req: web::Json<RegisterNodesRequest>,
) -> impl Responder {
    if register_req.nodes.is_empty() {
        return HttpResponse::BadRequest().json(error_body("Please supply a valid list of nodes"));
    }

    for address in &register_req.nodes {
        if let Err(err) = node.register_peer(address) {
            return HttpResponse::BadRequest().json(error_body(err));
        }
    }

    HttpResponse::Created().json(RegisterNodesResponse {
        message: "New nodes have been added".to_string(),
        total_nodes: node.peers().into_iter().collect(),
    })
}

/// Resolve conflicts
///
/// Fetches every peer's chain and adopts the longest valid one
#[utoipa::path(
    get,
    path = "/nodes/resolve",
    responses(
        (status = 200, description = "Resolution finished", body = ResolveResponse)
    )
)]
pub async fn resolve_conflicts(
    node: NodeData,
    fetcher: web::Data<HttpChainFetcher>,
) -> impl Responder {
    let outcome = node.clone().into_inner().resolve_conflicts(fetcher.get_ref()).await;
    let replaced = outcome.is_replaced();

    HttpResponse::Ok().json(ResolveResponse {
        message: if replaced {
            "Our chain was replaced".to_string()
        } else {
            "Our chain is authoritative".to_string()
        },
        replaced,
        chain: node.get_chain(),
    })
}

/// Check if the chain is valid
#[utoipa::path(
    get,
    path = "/validate",
    responses(
        (status = 200, description = "Chain validation status", body = bool)
    )
)]
pub async fn validate_chain(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.ledger().is_valid())
}
