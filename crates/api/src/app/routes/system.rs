use std::sync::Arc;

use axum::{extract::Extension, Json};

use crate::app::dto::{ConsumerStatus, HealthResponse};
use crate::app::services::StatsState;

/// Liveness. Always 200; the consume loop state is informational.
pub async fn health(Extension(state): Extension<Arc<StatsState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        consumer: state.consumer.as_ref().map(|probe| ConsumerStatus {
            state: probe.handle.state(),
            stats: probe.stats.snapshot(),
        }),
    })
}
