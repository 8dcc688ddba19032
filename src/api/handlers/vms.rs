//! VM lifecycle handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::types::{
    Status, StatusResponse, StopVmRequest, VmConfig, VmInfo, VmList, VmNetworkConfig, VmResponse,
};
use crate::api::validation::validate_vm_config;
use crate::hypervisor::VmIdentity;
use crate::node::NodeService;
use crate::vm::{RunningVm, VmState};

fn network_config(vm: &RunningVm) -> VmNetworkConfig {
    let lease = vm.lease();
    VmNetworkConfig {
        id: vm.id().to_string(),
        address: lease.ip_address.to_string(),
        bridge_address: lease.bridge_address.to_string(),
        netmask: lease.netmask.to_string(),
        mac_address: lease.mac_address.clone(),
        tap_device: lease.tap_device.clone(),
        vcpus: vm.identity().vcpu_count,
        memory: vm.identity().memory_mib,
    }
}

fn vm_info(node: &NodeService, vm: &RunningVm) -> VmInfo {
    let state = vm.state();
    let reason = match &state {
        VmState::Failed { reason } => Some(reason.clone()),
        _ => None,
    };
    VmInfo {
        id: vm.id().to_string(),
        state: state.to_string(),
        reason,
        address: vm.lease().ip_address.to_string(),
        tap_device: vm.lease().tap_device.clone(),
        pid: vm.hypervisor().pid(),
        started_at: humantime::format_rfc3339_seconds(vm.started_at()).to_string(),
        log_bytes: node.log_bytes(vm),
    }
}

/// Start a VM.
#[utoipa::path(
    post,
    path = "/api/v1/vms",
    tag = "VMs",
    request_body = VmConfig,
    responses(
        (status = 200, description = "VM started", body = VmResponse),
        (status = 400, description = "Invalid request", body = crate::api::types::ApiErrorResponse),
        (status = 409, description = "VM already exists", body = crate::api::types::ApiErrorResponse),
        (status = 500, description = "Start failed", body = crate::api::types::ApiErrorResponse)
    )
)]
pub async fn start_vm(
    State(node): State<Arc<NodeService>>,
    Json(req): Json<VmConfig>,
) -> Result<Json<VmResponse>, ApiError> {
    validate_vm_config(&req)?;

    let identity = VmIdentity {
        id: req.id,
        kernel_image_path: PathBuf::from(req.kernel_image_path),
        root_drive_path: PathBuf::from(req.root_filesystem),
        vcpu_count: req.vcpus,
        memory_mib: req.memory,
    };
    let vm = node.start_vm(identity).await?;

    Ok(Json(VmResponse {
        status: Status::Success,
        config: network_config(&vm),
    }))
}

/// List VM ids.
#[utoipa::path(
    get,
    path = "/api/v1/vms",
    tag = "VMs",
    responses(
        (status = 200, description = "Registered VMs", body = VmList)
    )
)]
pub async fn list_vms(State(node): State<Arc<NodeService>>) -> Json<VmList> {
    Json(VmList {
        ids: node.list_vms(),
    })
}

/// Get one VM.
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}",
    tag = "VMs",
    params(("id" = String, Path, description = "VM id")),
    responses(
        (status = 200, description = "VM details", body = VmInfo),
        (status = 404, description = "VM not found", body = crate::api::types::ApiErrorResponse)
    )
)]
pub async fn get_vm(
    State(node): State<Arc<NodeService>>,
    Path(id): Path<String>,
) -> Result<Json<VmInfo>, ApiError> {
    let vm = node.vm(&id)?;
    Ok(Json(vm_info(&node, &vm)))
}

/// Stop a VM and release its resources.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/stop",
    tag = "VMs",
    params(("id" = String, Path, description = "VM id")),
    request_body(content = StopVmRequest, description = "Optional stop options"),
    responses(
        (status = 200, description = "VM stopped", body = StatusResponse),
        (status = 404, description = "VM not found", body = crate::api::types::ApiErrorResponse),
        (status = 409, description = "Stop already in progress", body = crate::api::types::ApiErrorResponse)
    )
)]
pub async fn stop_vm(
    State(node): State<Arc<NodeService>>,
    Path(id): Path<String>,
    body: Option<Json<StopVmRequest>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let force = body.map(|Json(req)| req.force).unwrap_or(false);
    node.stop_vm(&id, force).await?;
    Ok(Json(StatusResponse {
        status: Status::Success,
    }))
}
