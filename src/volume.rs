//! Remote block volume attachment.
//!
//! A volume `<pool>/volume-<id>` is mapped to a local block device with the
//! configured map tool (`rbd-nbd` by default), formatted, mounted at
//! `<volume_mount_root>/<id>`, optionally populated, and unmounted again. The
//! mapping itself stays in place after the call returns.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::command::{path_arg, CommandRunner};
use crate::config::StorageSettings;
use crate::error::{Error, Result};
use crate::image::populate;

/// Result of attaching a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMapping {
    /// Volume id.
    pub volume_id: String,
    /// Storage pool.
    pub pool_name: String,
    /// Local block device the volume was mapped to.
    pub device_path: String,
    /// Where the volume was mounted while it was prepared.
    pub mount_path: PathBuf,
}

/// Validate a volume id or pool name for use in paths and tool arguments.
pub fn validate_volume_part(kind: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 128
        && !value.starts_with('-')
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_request(format!(
            "invalid {}: {:?} (use alphanumeric characters, '-', '_' or '.')",
            kind, value
        )))
    }
}

/// Maps, formats and populates remote volumes.
pub struct VolumeAttacher {
    runner: Arc<dyn CommandRunner>,
    map_tool: String,
    mount_root: PathBuf,
}

impl VolumeAttacher {
    /// Create an attacher.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &StorageSettings) -> Self {
        Self {
            runner,
            map_tool: settings.volume_map_tool.clone(),
            mount_root: settings.volume_mount_root.clone(),
        }
    }

    /// Map and format a volume, leaving it empty.
    pub fn attach(&self, volume_id: &str, pool: &str) -> Result<VolumeMapping> {
        self.attach_inner(volume_id, pool, None)
    }

    /// Map and format a volume, then copy `rootfs_dir`'s contents onto it.
    pub fn attach_with_rootfs(
        &self,
        volume_id: &str,
        pool: &str,
        rootfs_dir: &Path,
    ) -> Result<VolumeMapping> {
        self.attach_inner(volume_id, pool, Some(rootfs_dir))
    }

    fn attach_inner(
        &self,
        volume_id: &str,
        pool: &str,
        rootfs_dir: Option<&Path>,
    ) -> Result<VolumeMapping> {
        validate_volume_part("volume id", volume_id)?;
        validate_volume_part("pool name", pool)?;

        let image_spec = format!("{}/volume-{}", pool, volume_id);
        tracing::info!(volume = %volume_id, image = %image_spec, tool = %self.map_tool, "mapping volume");
        let device = self.step("map volume", &self.map_tool, &["map", &image_spec])?;
        // stderr is appended after stdout, so warnings can follow the path
        let device = device
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("/dev/"))
            .last()
            .ok_or_else(|| {
                Error::provisioning(
                    "map volume",
                    format!("{} printed no device path: {:?}", self.map_tool, device),
                )
            })?
            .to_string();

        tracing::info!(volume = %volume_id, device = %device, "creating ext4 filesystem");
        self.step("format volume", "mkfs.ext4", &["-F", &device])?;

        let mount_path = self.mount_root.join(volume_id);
        fs::create_dir_all(&mount_path).map_err(|e| {
            Error::provisioning("mount volume", format!("{}: {}", mount_path.display(), e))
        })?;
        let mount_arg = path_arg(&mount_path, "mount volume")?;
        self.step("mount volume", "mount", &[&device, mount_arg])?;

        let populated = match rootfs_dir {
            Some(src) => {
                tracing::info!(volume = %volume_id, source = %src.display(), "populating volume");
                populate(self.runner.as_ref(), src, &mount_path)
            }
            None => crate::image::remove_lost_found(&mount_path),
        };

        tracing::info!(volume = %volume_id, mount = %mount_path.display(), "unmounting volume");
        let unmounted = self.step("unmount volume", "umount", &[mount_arg]);
        populated?;
        unmounted?;

        Ok(VolumeMapping {
            volume_id: volume_id.to_string(),
            pool_name: pool.to_string(),
            device_path: device,
            mount_path,
        })
    }

    fn step(&self, step: &str, program: &str, args: &[&str]) -> Result<String> {
        self.runner
            .run(program, args)
            .map_err(|e| Error::provisioning(step, e.to_string()))
    }
}
