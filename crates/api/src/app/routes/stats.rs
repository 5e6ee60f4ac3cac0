//! Aggregate and dead-letter views.

use std::sync::Arc;

use axum::{extract::Extension, Json};

use orderflow_infra::{AggregateSnapshot, DeadLetterEvent};

use crate::app::services::StatsState;

/// Running averages: overall and per product.
pub async fn metrics(Extension(state): Extension<Arc<StatsState>>) -> Json<AggregateSnapshot> {
    Json(state.aggregator.snapshot())
}

/// Most recent dead-lettered messages, newest first.
pub async fn dead_letters(
    Extension(state): Extension<Arc<StatsState>>,
) -> Json<Vec<DeadLetterEvent>> {
    Json(state.journal.recent())
}
