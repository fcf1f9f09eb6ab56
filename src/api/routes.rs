use actix_web::{error, web, HttpResponse};

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    // Malformed or incomplete bodies get the same JSON error shape as handler failures
    let json_config = web::JsonConfig::default().error_handler(|err, _req| {
        let body = serde_json::json!({ "error": err.to_string() });
        error::InternalError::from_response(err, HttpResponse::BadRequest().json(body)).into()
    });

    cfg.app_data(json_config)
        .route("/chain", web::get().to(handlers::get_chain))
        .route("/transactions/pending", web::get().to(handlers::get_pending_transactions))
        .route("/transactions/new", web::post().to(handlers::new_transaction))
        .route("/mine", web::post().to(handlers::mine_block))
        .route("/nodes/register", web::post().to(handlers::register_nodes))
        .route("/nodes/resolve", web::get().to(handlers::resolve_conflicts))
        .route("/validate", web::get().to(handlers::validate_chain));
}
