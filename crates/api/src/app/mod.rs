//! HTTP application wiring (Axum router + pipeline wiring).
//!
//! - `services.rs`: pipeline wiring (transport, routers, consume loop) and the
//!   shared state read by the handlers
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: response DTOs

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod routes;
pub mod services;

pub use services::StatsState;

/// Build the stats router (public entrypoint used by the consumer binary).
pub fn build_app(state: StatsState) -> Router {
    routes::router()
        .layer(Extension(Arc::new(state)))
        .layer(ServiceBuilder::new())
}
