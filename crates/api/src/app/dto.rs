//! Response DTOs.

use serde::Serialize;

use orderflow_infra::{LoopState, LoopStatsSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<ConsumerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    pub state: LoopState,
    pub stats: LoopStatsSnapshot,
}
