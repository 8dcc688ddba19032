//! Health check handler.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::types::HealthResponse;
use crate::node::NodeService;

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
pub async fn health(State(node): State<Arc<NodeService>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
        vms: node.registry().len(),
    })
}
