use axum::{routing::get, Router};

pub mod stats;
pub mod system;

/// Router for every stats endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(stats::metrics))
        .route("/dlq", get(stats::dead_letters))
}
