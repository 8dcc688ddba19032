//! Drive build handler.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::types::{DriveResponse, ImageName, Status};
use crate::node::NodeService;

/// Pull an image and build an ext4 root drive from it.
#[utoipa::path(
    post,
    path = "/api/v1/drives",
    tag = "Storage",
    request_body = ImageName,
    responses(
        (status = 200, description = "Drive created", body = DriveResponse),
        (status = 400, description = "Invalid image name", body = crate::api::types::ApiErrorResponse),
        (status = 409, description = "Image is already being pulled", body = crate::api::types::ApiErrorResponse),
        (status = 500, description = "Provisioning failed", body = crate::api::types::ApiErrorResponse)
    )
)]
pub async fn create_drive(
    State(node): State<Arc<NodeService>>,
    Json(req): Json<ImageName>,
) -> Result<Json<DriveResponse>, ApiError> {
    let artifact = node.create_drive(&req.name).await?;
    Ok(Json(DriveResponse {
        status: Status::Success,
        path: artifact.rootfs_path.display().to_string(),
        size: artifact.size_bytes,
        disk_size: artifact.disk_bytes,
    }))
}
