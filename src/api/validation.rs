//! Request validation for the API.

use std::path::Path;

use crate::api::error::ApiError;
use crate::api::types::VmConfig;

/// Maximum VM id length. Keeps the API socket path short.
pub const MAX_VM_ID_LEN: usize = 64;

/// Firecracker's vCPU ceiling.
pub const MAX_VCPUS: u8 = 32;

/// Smallest guest memory accepted, in MiB.
pub const MIN_MEMORY_MIB: u32 = 32;

/// Validate a VM id.
///
/// Rules:
/// - Length: 1..=[`MAX_VM_ID_LEN`] characters
/// - Allowed characters: alphanumeric, hyphen (-), underscore (_), dot (.)
/// - Must start with a letter or digit
/// - No path separators (/, \)
pub fn validate_vm_id(id: &str) -> Result<(), ApiError> {
    let first_char = id
        .chars()
        .next()
        .ok_or_else(|| ApiError::BadRequest("vm id cannot be empty".to_string()))?;

    if id.len() > MAX_VM_ID_LEN {
        return Err(ApiError::BadRequest(format!(
            "vm id too long: {} characters (max {})",
            id.len(),
            MAX_VM_ID_LEN
        )));
    }

    if !first_char.is_ascii_alphanumeric() {
        return Err(ApiError::BadRequest(
            "vm id must start with a letter or digit".to_string(),
        ));
    }

    for c in id.chars() {
        if c == '/' || c == '\\' {
            return Err(ApiError::BadRequest(
                "vm id cannot contain path separators".to_string(),
            ));
        }
        if !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.') {
            return Err(ApiError::BadRequest(format!(
                "vm id contains invalid character: '{}'",
                c
            )));
        }
    }

    Ok(())
}

/// Validate a node-local file path from a request.
pub fn validate_host_path(path: &str, field: &str) -> Result<(), ApiError> {
    if path.is_empty() {
        return Err(ApiError::BadRequest(format!("{} cannot be empty", field)));
    }
    if !Path::new(path).is_absolute() {
        return Err(ApiError::BadRequest(format!(
            "{} must be an absolute path: {}",
            field, path
        )));
    }
    Ok(())
}

/// Validate a start request.
pub fn validate_vm_config(req: &VmConfig) -> Result<(), ApiError> {
    validate_vm_id(&req.id)?;
    validate_host_path(&req.kernel_image_path, "kernel_image_path")?;
    validate_host_path(&req.root_filesystem, "root_filesystem")?;

    if req.vcpus == 0 || req.vcpus > MAX_VCPUS {
        return Err(ApiError::BadRequest(format!(
            "vcpus must be between 1 and {}, got {}",
            MAX_VCPUS, req.vcpus
        )));
    }
    if req.memory < MIN_MEMORY_MIB {
        return Err(ApiError::BadRequest(format!(
            "memory must be at least {} MiB, got {}",
            MIN_MEMORY_MIB, req.memory
        )));
    }
    Ok(())
}
