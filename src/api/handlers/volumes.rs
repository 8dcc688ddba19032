//! Volume attach handler.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::types::{Status, Volume, VolumeResponse};
use crate::node::NodeService;

/// Map, format and optionally populate a remote volume.
#[utoipa::path(
    post,
    path = "/api/v1/volumes",
    tag = "Storage",
    request_body = Volume,
    responses(
        (status = 200, description = "Volume attached", body = VolumeResponse),
        (status = 400, description = "Invalid volume id or pool", body = crate::api::types::ApiErrorResponse),
        (status = 409, description = "Volume is already being attached", body = crate::api::types::ApiErrorResponse),
        (status = 500, description = "Provisioning failed", body = crate::api::types::ApiErrorResponse)
    )
)]
pub async fn connect_volume(
    State(node): State<Arc<NodeService>>,
    Json(req): Json<Volume>,
) -> Result<Json<VolumeResponse>, ApiError> {
    let mapping = node
        .connect_volume(&req.volume_id, &req.pool_name, req.image.as_deref())
        .await?;
    Ok(Json(VolumeResponse {
        status: Status::Success,
        device_path: mapping.device_path,
        mount_path: mapping.mount_path.display().to_string(),
    }))
}
