//! HTTP surface: ingestion paths plus operational endpoints

pub mod handlers;
pub mod middleware;
pub mod response;

use crate::listeners::http::ingest;
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

pub fn create_router(state: AppState) -> Router {
    let max_body_size = state.config.server.max_request_body_size;
    let cors_origins = state.config.server.cors_origins.clone();

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/in-flight", get(handlers::in_flight))
        .route("/dead-letters", get(handlers::list_dead_letters))
        .route("/dead-letters/:id", get(handlers::get_dead_letter))
        .route("/dead-letters/:id/replay", post(handlers::replay_dead_letter));

    for path in state.http_bindings.keys() {
        router = router.route(path, post(ingest));
    }

    router
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::metrics_middleware))
        .layer(middleware::compression())
        .layer(middleware::cors(&cors_origins))
        .layer(DefaultBodyLimit::max(max_body_size))
}
