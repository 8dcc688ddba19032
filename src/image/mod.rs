//! Image provisioning: registry image to bootable ext4 drive.
//!
//! # Pipeline
//!
//! ```text
//! sanitize name -> scratch dir -> skopeo copy (docker:// -> oci:)
//!   -> umoci raw unpack -> measure tree -> mkfs.ext4 drive file
//!   -> loop mount -> cp -a -> umount
//! ```
//!
//! Each step failure is reported as [`Error::Provisioning`] naming the step.
//! Scratch directories live under `storage.scratch_root`, one per image, and
//! are kept unless `storage.cleanup_scratch` is set.

pub mod auth;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::{path_arg, CommandRunner};
use crate::config::StorageSettings;
use crate::error::{Error, Result};
use auth::RegistryConfig;

/// Name of the OCI layout directory inside a scratch dir.
const LAYOUT_DIR: &str = "layout";
/// Name of the unpacked tree inside a scratch dir.
const ROOTFS_DIR: &str = "rootfs";
/// Name of the loop mount point inside a scratch dir.
const MOUNT_DIR: &str = "mnt";
/// Name of the drive file inside a scratch dir.
const DRIVE_FILE: &str = "rootfs.ext4";

/// Smallest drive we create, in bytes.
const MIN_DRIVE_BYTES: u64 = 64 * 1024 * 1024;
/// Fixed filesystem overhead added to every drive (journal, inode tables).
const DRIVE_FIXED_HEADROOM: u64 = 32 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// An image pulled and unpacked into a scratch directory.
#[derive(Debug, Clone)]
pub struct UnpackedImage {
    /// Scratch directory for this image.
    pub working_dir: PathBuf,
    /// Unpacked root filesystem tree.
    pub rootfs_dir: PathBuf,
    /// Total size of non-directory entries in the tree.
    pub size_bytes: u64,
}

/// A bootable drive built from an image.
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    /// Scratch directory the drive was built in.
    pub working_dir: PathBuf,
    /// ext4 drive file.
    pub rootfs_path: PathBuf,
    /// Size of the unpacked tree copied into the drive.
    pub size_bytes: u64,
    /// Size of the drive file.
    pub disk_bytes: u64,
}

/// Turn an image reference into a single path component.
///
/// Path separators become `-`; tag and digest separators become `_` so the
/// directory can appear in an `oci:<dir>:<tag>` reference.
pub fn sanitize_image_name(image: &str) -> Result<String> {
    let trimmed = image.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_request("image name cannot be empty"));
    }
    if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::invalid_request(format!(
            "image name contains whitespace: {:?}",
            image
        )));
    }

    let sanitized: String = trimmed
        .chars()
        .map(|c| match c {
            '/' => '-',
            ':' | '@' => '_',
            other => other,
        })
        .collect();

    if sanitized == "." || sanitized == ".." || sanitized.starts_with('-') {
        return Err(Error::invalid_request(format!(
            "invalid image name: {:?}",
            image
        )));
    }
    Ok(sanitized)
}

/// Total size of all non-directory entries under `dir`.
///
/// Symlinks are counted by their own size and never followed.
pub fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let metadata = fs::symlink_metadata(entry.path())?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

/// Drive file size for a tree of `tree_bytes`: a quarter extra plus fixed
/// overhead, at least [`MIN_DRIVE_BYTES`], rounded up to a MiB.
pub fn drive_size_for(tree_bytes: u64) -> u64 {
    let wanted = tree_bytes + tree_bytes / 4 + DRIVE_FIXED_HEADROOM;
    wanted.max(MIN_DRIVE_BYTES).div_ceil(MIB) * MIB
}

/// Pulls images and builds drives from them.
pub struct ImageProvisioner {
    runner: Arc<dyn CommandRunner>,
    settings: StorageSettings,
    registry: RegistryConfig,
}

impl ImageProvisioner {
    /// Create a provisioner.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settings: StorageSettings,
        registry: RegistryConfig,
    ) -> Self {
        Self {
            runner,
            settings,
            registry,
        }
    }

    /// Scratch directory used for `image`.
    pub fn work_dir(&self, image: &str) -> Result<PathBuf> {
        Ok(self.settings.scratch_root.join(sanitize_image_name(image)?))
    }

    /// Run the full pipeline and return the built drive.
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn pull_and_unpack(&self, image: &str) -> Result<ImageArtifact> {
        let unpacked = self.pull(image)?;
        let artifact = self.build_drive(&unpacked)?;

        if self.settings.cleanup_scratch {
            self.remove_intermediates(&unpacked.working_dir);
        }

        tracing::info!(
            image = %image,
            path = %artifact.rootfs_path.display(),
            size_bytes = artifact.size_bytes,
            disk_bytes = artifact.disk_bytes,
            "drive created"
        );
        Ok(artifact)
    }

    /// Copy `image` into a fresh scratch directory and unpack it.
    pub fn pull(&self, image: &str) -> Result<UnpackedImage> {
        let working_dir = self.work_dir(image)?;
        self.prepare_work_dir(&working_dir)?;

        let layout = working_dir.join(LAYOUT_DIR);
        let layout_ref = format!("{}:{}", path_arg(&layout, "copy image")?, self.settings.image_tag);
        self.copy_image(image, &layout_ref)?;

        let rootfs_dir = working_dir.join(ROOTFS_DIR);
        tracing::info!(image = %image, target = %rootfs_dir.display(), "unpacking layers");
        self.step(
            "unpack image",
            "umoci",
            &[
                "raw",
                "unpack",
                "--image",
                &layout_ref,
                path_arg(&rootfs_dir, "unpack image")?,
            ],
        )?;

        let size_bytes = dir_size(&rootfs_dir).map_err(|e| {
            Error::provisioning(
                "measure rootfs",
                format!("{}: {}", rootfs_dir.display(), e),
            )
        })?;
        tracing::debug!(image = %image, size_bytes, "measured unpacked tree");

        Ok(UnpackedImage {
            working_dir,
            rootfs_dir,
            size_bytes,
        })
    }

    fn prepare_work_dir(&self, working_dir: &Path) -> Result<()> {
        if working_dir.exists() {
            tracing::debug!(dir = %working_dir.display(), "removing stale scratch directory");
            fs::remove_dir_all(working_dir).map_err(|e| {
                Error::provisioning(
                    "create work dir",
                    format!("remove stale {}: {}", working_dir.display(), e),
                )
            })?;
        }
        tracing::info!(dir = %working_dir.display(), "creating work dir");
        fs::create_dir_all(working_dir).map_err(|e| {
            Error::provisioning(
                "create work dir",
                format!("{}: {}", working_dir.display(), e),
            )
        })
    }

    fn copy_image(&self, image: &str, layout_ref: &str) -> Result<()> {
        let source = self.registry.resolve(image);
        let src = format!("docker://{}", source.reference);
        let dest = format!("oci:{}", layout_ref);
        let creds = source.auth.as_ref().map(|a| a.to_creds_arg());

        // Signatures are not verified: images are accepted as-is.
        let mut args = vec!["--insecure-policy", "copy"];
        if let Some(creds) = creds.as_deref() {
            args.extend(["--src-creds", creds]);
        }
        args.extend([src.as_str(), dest.as_str()]);

        tracing::info!(image = %image, source = %source.reference, "copying image");
        self.step("copy image", "skopeo", &args)?;
        Ok(())
    }

    /// Build an ext4 drive file holding `unpacked`'s tree.
    pub fn build_drive(&self, unpacked: &UnpackedImage) -> Result<ImageArtifact> {
        let drive = unpacked.working_dir.join(DRIVE_FILE);
        let disk_bytes = drive_size_for(unpacked.size_bytes);

        let file = fs::File::create(&drive).map_err(|e| {
            Error::provisioning("create drive", format!("{}: {}", drive.display(), e))
        })?;
        file.set_len(disk_bytes).map_err(|e| {
            Error::provisioning("create drive", format!("{}: {}", drive.display(), e))
        })?;
        drop(file);

        let drive_arg = path_arg(&drive, "format drive")?;
        self.step(
            "format drive",
            "mkfs.ext4",
            &["-F", "-q", "-m", "0", "-L", "rootfs", drive_arg],
        )?;

        let mount_point = unpacked.working_dir.join(MOUNT_DIR);
        fs::create_dir_all(&mount_point).map_err(|e| {
            Error::provisioning("mount drive", format!("{}: {}", mount_point.display(), e))
        })?;
        let mount_arg = path_arg(&mount_point, "mount drive")?;
        self.step("mount drive", "mount", &["-o", "loop", drive_arg, mount_arg])?;

        let populated = populate(self.runner.as_ref(), &unpacked.rootfs_dir, &mount_point);

        // Always unmount, even if populating failed
        let unmounted = self.step("unmount drive", "umount", &[mount_arg]);
        populated?;
        unmounted?;

        Ok(ImageArtifact {
            working_dir: unpacked.working_dir.clone(),
            rootfs_path: drive,
            size_bytes: unpacked.size_bytes,
            disk_bytes,
        })
    }

    /// Remove the layout, unpacked tree and mount point, keeping the drive.
    pub fn remove_intermediates(&self, working_dir: &Path) {
        for name in [LAYOUT_DIR, ROOTFS_DIR, MOUNT_DIR] {
            let path = working_dir.join(name);
            if let Err(e) = fs::remove_dir_all(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch data");
                }
            }
        }
    }

    fn step(&self, step: &str, program: &str, args: &[&str]) -> Result<String> {
        self.runner
            .run(program, args)
            .map_err(|e| Error::provisioning(step, e.to_string()))
    }
}

/// Remove `lost+found` from a fresh filesystem and copy `source`'s contents in.
pub(crate) fn populate(runner: &dyn CommandRunner, source: &Path, mount_point: &Path) -> Result<()> {
    remove_lost_found(mount_point)?;

    let mut from = path_arg(source, "copy rootfs")?.to_string();
    from.push_str("/.");
    runner
        .run("cp", &["-a", &from, path_arg(mount_point, "copy rootfs")?])
        .map_err(|e| Error::provisioning("copy rootfs", e.to_string()))?;
    Ok(())
}

/// Remove the `lost+found` directory mkfs creates. Absent is fine.
pub(crate) fn remove_lost_found(mount_point: &Path) -> Result<()> {
    match fs::remove_dir(mount_point.join("lost+found")) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::provisioning("remove lost+found", e.to_string())),
    }
}
