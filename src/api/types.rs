//! JSON request and response types for the API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Outcome marker carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// The operation succeeded.
    Success,
    /// The operation failed; `error` and `code` say why.
    Failed,
}

// ============================================================================
// VM Types
// ============================================================================

fn default_vcpus() -> u8 {
    1
}

fn default_memory() -> u32 {
    512
}

/// Request to start a VM.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct VmConfig {
    /// Unique VM id.
    #[schema(example = "vm-7f3c2a1b")]
    pub id: String,
    /// Guest kernel image on the node.
    #[schema(example = "/var/lib/catapult/kernels/vmlinux")]
    pub kernel_image_path: String,
    /// Root drive file on the node, usually from `POST /api/v1/drives`.
    #[schema(example = "/var/lib/catapult/images/library-alpine/rootfs.ext4")]
    pub root_filesystem: String,
    /// Number of vCPUs.
    #[serde(default = "default_vcpus")]
    #[schema(example = 2)]
    pub vcpus: u8,
    /// Memory in MiB.
    #[serde(default = "default_memory")]
    #[schema(example = 512)]
    pub memory: u32,
}

/// Network and machine identity of a started VM.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VmNetworkConfig {
    /// VM id.
    pub id: String,
    /// Guest IPv4 address.
    #[schema(example = "172.16.0.7")]
    pub address: String,
    /// Bridge address, the guest's gateway.
    #[schema(example = "172.16.0.1")]
    pub bridge_address: String,
    /// Guest netmask.
    #[schema(example = "255.255.255.0")]
    pub netmask: String,
    /// Guest MAC address.
    #[schema(example = "02:5e:11:a0:3c:44")]
    pub mac_address: String,
    /// Host tap device.
    #[schema(example = "fc-2a1b3c")]
    pub tap_device: String,
    /// Number of vCPUs.
    pub vcpus: u8,
    /// Memory in MiB.
    pub memory: u32,
}

/// Response to a VM start.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VmResponse {
    /// Outcome.
    pub status: Status,
    /// Identity the VM was started with.
    pub config: VmNetworkConfig,
}

/// Optional body of a stop request.
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct StopVmRequest {
    /// Skip the graceful shutdown and kill the hypervisor.
    #[serde(default)]
    pub force: bool,
}

/// Response carrying only an outcome.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    /// Outcome.
    pub status: Status,
}

/// Ids of the VMs on this node.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VmList {
    /// Sorted VM ids.
    pub ids: Vec<String>,
}

/// Details of one VM.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VmInfo {
    /// VM id.
    pub id: String,
    /// "running", "stopping" or "failed".
    #[schema(example = "running")]
    pub state: String,
    /// Why the VM failed, for failed VMs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Guest IPv4 address.
    pub address: String,
    /// Host tap device.
    pub tap_device: String,
    /// Hypervisor process id.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = 12345)]
    pub pid: Option<u32>,
    /// Registration time, RFC 3339.
    #[schema(example = "2026-10-19T08:30:00Z")]
    pub started_at: String,
    /// Bytes used by the VM's log and metrics files.
    pub log_bytes: u64,
}

// ============================================================================
// Drive and Volume Types
// ============================================================================

/// Image to build a drive from.
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ImageName {
    /// Image reference, as accepted by `skopeo copy docker://`.
    #[schema(example = "library/alpine:3.19")]
    pub name: String,
}

/// Response to a drive build.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DriveResponse {
    /// Outcome.
    pub status: Status,
    /// Path of the ext4 drive file.
    pub path: String,
    /// Total size of the image's files in bytes.
    pub size: u64,
    /// Size of the drive file in bytes.
    pub disk_size: u64,
}

/// Volume to attach.
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct Volume {
    /// Volume id; the remote image is `volume-<id>`.
    #[schema(example = "7f3c2a1b")]
    pub volume_id: String,
    /// Storage pool holding the volume.
    #[schema(example = "rbd")]
    pub pool_name: String,
    /// Image whose root filesystem is copied onto the volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Response to a volume attach.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VolumeResponse {
    /// Outcome.
    pub status: Status,
    /// Local block device.
    #[schema(example = "/dev/nbd0")]
    pub device_path: String,
    /// Where the volume was prepared.
    #[schema(example = "/tmp/7f3c2a1b")]
    pub mount_path: String,
}

// ============================================================================
// Health and Error Types
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Health status.
    #[schema(example = "ok")]
    pub status: String,
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: String,
    /// Number of registered VMs.
    pub vms: usize,
}

/// API error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorResponse {
    /// Always `FAILED`.
    pub status: Status,
    /// Error message.
    #[schema(example = "vm not found: vm-1")]
    pub error: String,
    /// Error code.
    #[schema(example = "NOT_FOUND")]
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&Status::Success).unwrap(), "\"SUCCESS\"");
        assert_eq!(serde_json::to_string(&Status::Failed).unwrap(), "\"FAILED\"");
    }

    #[test]
    fn test_vm_config_defaults() {
        let req: VmConfig = serde_json::from_str(
            r#"{"id":"vm-1","kernel_image_path":"/k","root_filesystem":"/r"}"#,
        )
        .unwrap();
        assert_eq!(req.vcpus, 1);
        assert_eq!(req.memory, 512);
    }

    #[test]
    fn test_volume_image_is_optional() {
        let vol: Volume = serde_json::from_str(r#"{"volume_id":"v1","pool_name":"rbd"}"#).unwrap();
        assert!(vol.image.is_none());
    }
}
