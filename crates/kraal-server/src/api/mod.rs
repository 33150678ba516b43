//! API routes and handlers.

pub mod node;
pub mod openai;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // OpenAI-compatible surface
        .route("/v1/models", get(openai::list_models))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/embeddings", post(openai::embeddings))
        // Node control
        .route("/health", get(node::health))
        .route("/startup", get(node::startup))
        .route("/metrics", get(node::metrics_json))
        .route("/metrics/prom", get(node::metrics_prom))
        .route("/pull", post(node::pull))
        .route("/log/level", get(node::get_log_level).post(node::set_log_level))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
