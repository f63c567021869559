//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::server::ApiState;
use crate::controller::AgentState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub agent: String,
}

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agent: state.agent_name.clone(),
    })
}

/// Base state last published at the agent root
#[instrument(skip(state))]
pub async fn agent_state(State(state): State<Arc<ApiState>>) -> Json<AgentState> {
    Json(state.agent.state().await)
}

/// Metrics endpoint handler
pub async fn metrics() -> String {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &crate::controller::metrics::REGISTRY) {
        tracing::error!("Failed to encode metrics: {:?}", e);
    }
    buffer
}
