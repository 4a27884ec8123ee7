use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Query answering
            .route("/query", post(handlers::api::run_query))

            // Approvals
            .route("/approve/{cache_id}", post(handlers::api::approve))
            .route("/approved", get(handlers::api::list_approved))
            .route("/similar", post(handlers::api::similar_approved))

            // Cache maintenance
            .route("/cache/recent", get(handlers::api::recent_cache))
            .route("/cache/sweep", post(handlers::api::sweep_cache))
            .route("/catalog/refresh", post(handlers::api::refresh_catalog))

            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
