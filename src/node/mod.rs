//! Node service.
//!
//! [`NodeService`] owns the VM registry and the provisioners and runs each
//! operation in order, rolling back what it created when a later step fails.
//! Command-runner work is pushed onto the blocking pool; no registry lock is
//! held across an await.

pub mod reaper;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{JoinError, JoinSet};

use crate::command::{CommandRunner, SystemRunner};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::hypervisor::{FirecrackerLauncher, VmIdentity, VmmLauncher};
use crate::image::{sanitize_image_name, ImageArtifact, ImageProvisioner};
use crate::network::{IpAllocator, NetworkLease, NetworkProvisioner};
use crate::process::VmExit;
use crate::vm::{RunningVm, VmRegistry};
use crate::volume::{validate_volume_part, VolumeAttacher, VolumeMapping};

pub use reaper::Reaper;

/// How long a stop waits for the drains to finish.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run blocking work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(join_error)?
}

fn join_error(e: JoinError) -> Error {
    Error::Io(std::io::Error::other(e))
}

/// Claim on a key in an in-flight set, released on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a Mutex<HashSet<String>>, kind: &str, key: String) -> Result<Self> {
        if !set.lock().insert(key.clone()) {
            return Err(Error::busy(format!("{} {} is already being prepared", kind, key)));
        }
        Ok(Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Everything the node runs.
pub struct NodeService {
    config: NodeConfig,
    registry: VmRegistry,
    network: Arc<NetworkProvisioner>,
    images: Arc<ImageProvisioner>,
    volumes: Arc<VolumeAttacher>,
    launcher: Arc<dyn VmmLauncher>,
    images_in_flight: Mutex<HashSet<String>>,
    volumes_in_flight: Mutex<HashSet<String>>,
}

impl NodeService {
    /// Build a service with an explicit runner and launcher.
    pub fn new(
        config: NodeConfig,
        runner: Arc<dyn CommandRunner>,
        launcher: Arc<dyn VmmLauncher>,
    ) -> Self {
        let allocator = Arc::new(IpAllocator::new(runner.clone(), config.network.scan));
        let network = Arc::new(NetworkProvisioner::new(
            runner.clone(),
            allocator,
            &config.network,
        ));
        let images = Arc::new(ImageProvisioner::new(
            runner.clone(),
            config.storage.clone(),
            config.registry.clone(),
        ));
        let volumes = Arc::new(VolumeAttacher::new(runner, &config.storage));

        Self {
            config,
            registry: VmRegistry::new(),
            network,
            images,
            volumes,
            launcher,
            images_in_flight: Mutex::new(HashSet::new()),
            volumes_in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Build a service that runs host tools and Firecracker for real.
    pub fn from_config(config: NodeConfig) -> Self {
        let launcher = FirecrackerLauncher::new(config.hypervisor.clone());
        if let Err(e) = launcher.check_binary() {
            // Not fatal: drives and volumes still work without it
            tracing::warn!(error = %e, "hypervisor binary unavailable, vm starts will fail");
        }
        Self::new(config, Arc::new(SystemRunner), Arc::new(launcher))
    }

    /// Active configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// VM registry.
    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    /// Start a VM: reserve, allocate network, launch, register.
    ///
    /// The network lease is rolled back if the launch fails. The start runs
    /// as its own task and finishes, or rolls back, even if the caller stops
    /// waiting for it.
    pub async fn start_vm(self: &Arc<Self>, identity: VmIdentity) -> Result<Arc<RunningVm>> {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.start_detached(identity).await })
            .await
            .map_err(join_error)?
    }

    async fn start_detached(&self, identity: VmIdentity) -> Result<Arc<RunningVm>> {
        let tap = self.network.tap_name(&identity.id);
        let guard = self.registry.reserve(&identity.id, &tap)?;

        tracing::info!(
            vm = %identity.id,
            kernel = %identity.kernel_image_path.display(),
            drive = %identity.root_drive_path.display(),
            vcpus = identity.vcpu_count,
            memory_mib = identity.memory_mib,
            "starting vm"
        );

        let network = self.network.clone();
        let vm_id = identity.id.clone();
        let lease = blocking(move || network.allocate(&vm_id)).await?;

        match self.launcher.launch(&identity, &lease).await {
            Ok(launched) => {
                let vm = guard.complete(RunningVm::new(identity, lease, launched));
                tracing::info!(
                    vm = %vm.id(),
                    ip = %vm.lease().ip_address,
                    pid = ?vm.hypervisor().pid(),
                    "vm started"
                );
                Ok(vm)
            }
            Err(e) => {
                tracing::warn!(vm = %identity.id, error = %e, "launch failed, rolling back network");
                self.release_network(lease).await;
                Err(e)
            }
        }
    }

    /// Stop a VM and tear down everything it holds.
    ///
    /// Stopping an unknown id fails with `VmNotFound`; a stop already in
    /// progress fails with `InvalidState`. Teardown runs as its own task, so
    /// a dropped caller never leaves the VM stuck in `stopping`.
    pub async fn stop_vm(self: &Arc<Self>, id: &str, force: bool) -> Result<VmExit> {
        let node = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move { node.stop_detached(&id, force).await })
            .await
            .map_err(join_error)?
    }

    async fn stop_detached(&self, id: &str, force: bool) -> Result<VmExit> {
        let vm = self.registry.begin_stop(id)?;
        tracing::info!(vm = %id, force, "stopping vm");

        let stopped = vm.hypervisor().stop(force).await;
        vm.logs().shutdown(DRAIN_JOIN_TIMEOUT).await;
        if vm.claim_network_release() {
            self.release_network(vm.lease().clone()).await;
        }
        self.registry.remove(id);

        let exit = stopped?;
        tracing::info!(vm = %id, exit = %exit, "vm stopped");
        Ok(exit)
    }

    /// Ids of registered VMs, sorted.
    pub fn list_vms(&self) -> Vec<String> {
        self.registry.list_ids()
    }

    /// Look up one VM.
    pub fn vm(&self, id: &str) -> Result<Arc<RunningVm>> {
        self.registry.get(id)
    }

    /// Bytes on disk of a VM's log and metrics files, rotated generations
    /// included.
    pub fn log_bytes(&self, vm: &RunningVm) -> u64 {
        vm.logs()
            .files()
            .iter()
            .map(|f| self.config.logs.total_size(f))
            .sum()
    }

    /// Pull `image` and build an ext4 drive from it.
    pub async fn create_drive(&self, image: &str) -> Result<ImageArtifact> {
        let _claim = InFlight::claim(&self.images_in_flight, "image", sanitize_image_name(image)?)?;
        let images = self.images.clone();
        let image = image.to_string();
        blocking(move || images.pull_and_unpack(&image)).await
    }

    /// Map and format a volume, optionally populating it from `image`.
    pub async fn connect_volume(
        &self,
        volume_id: &str,
        pool: &str,
        image: Option<&str>,
    ) -> Result<VolumeMapping> {
        validate_volume_part("volume id", volume_id)?;
        validate_volume_part("pool name", pool)?;
        let _claim = InFlight::claim(
            &self.volumes_in_flight,
            "volume",
            format!("{}/{}", pool, volume_id),
        )?;

        let volumes = self.volumes.clone();
        let volume_id = volume_id.to_string();
        let pool = pool.to_string();

        match image {
            None => blocking(move || volumes.attach(&volume_id, &pool)).await,
            Some(image) => {
                let _image_claim =
                    InFlight::claim(&self.images_in_flight, "image", sanitize_image_name(image)?)?;
                let images = self.images.clone();
                let image = image.to_string();
                blocking(move || {
                    let unpacked = images.pull(&image)?;
                    volumes.attach_with_rootfs(&volume_id, &pool, &unpacked.rootfs_dir)
                })
                .await
            }
        }
    }

    /// Mark VMs whose hypervisor exited on its own as failed and release
    /// their network. Returns the ids newly marked.
    pub async fn reap_exited(&self) -> Vec<String> {
        let mut reaped = Vec::new();
        for vm in self.registry.list() {
            let Some(exit) = vm.hypervisor().exit_status() else {
                continue;
            };
            let reason = format!("hypervisor exited unexpectedly ({})", exit);
            if !self.registry.mark_failed(vm.id(), reason).unwrap_or(false) {
                continue;
            }

            tracing::warn!(vm = %vm.id(), exit = %exit, "vm failed");
            vm.logs().shutdown(DRAIN_JOIN_TIMEOUT).await;
            if vm.claim_network_release() {
                self.release_network(vm.lease().clone()).await;
            }
            reaped.push(vm.id().to_string());
        }
        reaped
    }

    /// Rotate every registered VM's log files that grew past the limit.
    pub fn rotate_logs(&self) {
        for vm in self.registry.list() {
            for file in vm.logs().files() {
                match self.config.logs.rotate_if_needed(file) {
                    Ok(true) => tracing::info!(vm = %vm.id(), file = %file.display(), "rotated log"),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(vm = %vm.id(), file = %file.display(), error = %e, "log rotation failed")
                    }
                }
            }
        }
    }

    /// Gracefully stop every VM concurrently.
    pub async fn shutdown_all(self: &Arc<Self>) {
        let ids = self.list_vms();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "stopping all vms");

        let mut stops = JoinSet::new();
        for id in ids {
            let node = Arc::clone(self);
            stops.spawn(async move {
                let result = node.stop_vm(&id, false).await;
                (id, result)
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                // Already gone or being stopped elsewhere
                Ok((_, Err(Error::VmNotFound { .. } | Error::InvalidState { .. }))) => {}
                Ok((id, Err(e))) => tracing::warn!(vm = %id, error = %e, "failed to stop vm"),
                Err(e) => tracing::warn!(error = %e, "stop task failed"),
            }
        }
    }

    async fn release_network(&self, lease: NetworkLease) {
        let network = self.network.clone();
        let tap = lease.tap_device.clone();
        if let Err(e) = blocking(move || network.release(&lease)).await {
            tracing::warn!(tap = %tap, error = %e, "failed to release network");
        }
    }
}
