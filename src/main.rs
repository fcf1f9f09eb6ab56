use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use ledger_node::{Node, NodeConfig};

mod api;

use api::HttpChainFetcher;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::get_pending_transactions,
        api::handlers::new_transaction,
        api::handlers::mine_block,
        api::handlers::register_nodes,
        api::handlers::resolve_conflicts,
        api::handlers::validate_chain
    ),
    components(
        schemas(
            ledger_node::blockchain::Block,
            ledger_node::blockchain::Transaction,
            api::handlers::ChainResponse,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MineResponse,
            api::handlers::RegisterNodesRequest,
            api::handlers::RegisterNodesResponse,
            api::handlers::ResolveResponse
        )
    ),
    tags(
        (name = "ledger", description = "Ledger node endpoints")
    ),
    info(
        title = "Ledger Node API",
        version = "0.1.0",
        description = "Proof-of-work ledger with longest-valid-chain consensus",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

// Periodically pull peer chains, mirroring what GET /nodes/resolve does on demand
fn spawn_sync_task(node: web::Data<Node>, fetcher: web::Data<HttpChainFetcher>, every: Duration) {
    actix_web::rt::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;

            if node.peers().is_empty() {
                continue;
            }

            let outcome = node.clone().into_inner().resolve_conflicts(fetcher.get_ref()).await;
            if outcome.is_replaced() {
                info!("Background sync replaced the chain (length {})", node.get_chain_length());
            }
        }
    });
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::from_env()?;
    let node = web::Data::new(Node::new(&config)?);
    let fetcher = web::Data::new(HttpChainFetcher::new(config.fetch_timeout, config.max_chain_bytes));

    info!(
        "Node {} starting with difficulty {} and {} peers",
        node.node_id(),
        config.difficulty,
        node.peers().len()
    );

    match config.sync_interval {
        Some(every) => spawn_sync_task(node.clone(), fetcher.clone(), every),
        None => warn!("Background sync disabled"),
    }

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    let openapi = ApiDoc::openapi();

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(node.clone())
            .app_data(fetcher.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone()),
            )
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
