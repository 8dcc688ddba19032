//! Hypervisor supervision.
//!
//! A [`VmmLauncher`] turns a [`VmIdentity`] and a [`NetworkLease`] into a
//! running hypervisor, returning a [`HypervisorHandle`] to control it and the
//! [`LogTasks`] draining its log and metrics FIFOs.
//!
//! # Architecture
//!
//! ```text
//! HypervisorHandle --StopRequest--> monitor task (owns Child)
//!        ^                              |  SIGINT/SIGTERM: graceful
//!        +------ watch<Option<VmExit>> -+  SIGQUIT: forced
//! LogTasks --watch<bool>--> drain(log fifo), drain(metrics fifo)
//! ```

pub mod api;
pub mod config;
pub mod firecracker;
pub mod logs;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Error, Result};
use crate::network::NetworkLease;
use crate::process::VmExit;

pub use config::HypervisorConfig;
pub use firecracker::FirecrackerLauncher;
pub use logs::LogTasks;

/// Boxed future returned by [`VmmLauncher::launch`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Immutable description of a VM, built from the start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    /// Caller-supplied unique id.
    pub id: String,
    /// Guest kernel image.
    pub kernel_image_path: PathBuf,
    /// Root drive file.
    pub root_drive_path: PathBuf,
    /// Number of vCPUs.
    pub vcpu_count: u8,
    /// Guest memory in MiB.
    pub memory_mib: u32,
}

/// Per-VM file locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    /// API socket, `<vm_data_dir>/<id>`.
    pub socket: PathBuf,
    /// Generated config file, `<vm_data_dir>/<id>.json`.
    pub config_file: PathBuf,
    /// Logger FIFO, `<log_dir>/<id>.fifo`.
    pub log_fifo: PathBuf,
    /// Metrics FIFO, `<log_dir>/<id>-metrics.fifo`.
    pub metrics_fifo: PathBuf,
    /// Durable log file, `<log_dir>/<id>.log`.
    pub log_file: PathBuf,
    /// Durable metrics file, `<log_dir>/<id>-metrics.log`.
    pub metrics_file: PathBuf,
    /// Hypervisor stdout and stderr, `<log_dir>/<id>-console.log`.
    pub console_log: PathBuf,
}

impl VmPaths {
    /// Paths for VM `id`.
    pub fn new(vm_data_dir: &Path, log_dir: &Path, id: &str) -> Self {
        Self {
            socket: vm_data_dir.join(id),
            config_file: vm_data_dir.join(format!("{}.json", id)),
            log_fifo: log_dir.join(format!("{}.fifo", id)),
            metrics_fifo: log_dir.join(format!("{}-metrics.fifo", id)),
            log_file: log_dir.join(format!("{}.log", id)),
            metrics_file: log_dir.join(format!("{}-metrics.log", id)),
            console_log: log_dir.join(format!("{}-console.log", id)),
        }
    }
}

/// Request sent from a handle to the monitor task.
pub(crate) struct StopRequest {
    pub(crate) force: bool,
    pub(crate) reply: oneshot::Sender<Result<VmExit>>,
}

/// Control handle for one running hypervisor.
#[derive(Debug)]
pub struct HypervisorHandle {
    vm_id: String,
    pid: Option<u32>,
    socket_path: PathBuf,
    control: mpsc::Sender<StopRequest>,
    exit: watch::Receiver<Option<VmExit>>,
}

impl std::fmt::Debug for StopRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopRequest").field("force", &self.force).finish()
    }
}

impl HypervisorHandle {
    pub(crate) fn new(
        vm_id: String,
        pid: Option<u32>,
        socket_path: PathBuf,
        control: mpsc::Sender<StopRequest>,
        exit: watch::Receiver<Option<VmExit>>,
    ) -> Self {
        Self {
            vm_id,
            pid,
            socket_path,
            control,
            exit,
        }
    }

    /// VM id this handle controls.
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// Hypervisor process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// API socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Exit status, once the process is gone.
    pub fn exit_status(&self) -> Option<VmExit> {
        *self.exit.borrow()
    }

    /// Whether the process has exited.
    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Stop the hypervisor.
    ///
    /// Graceful stop asks the guest to shut down and escalates to SIGKILL
    /// after the configured timeout. `force` skips straight to SIGKILL.
    /// Stopping an already exited process returns its recorded exit.
    pub async fn stop(&self, force: bool) -> Result<VmExit> {
        if let Some(exit) = self.exit_status() {
            return Ok(exit);
        }

        let (reply, response) = oneshot::channel();
        if self
            .control
            .send(StopRequest { force, reply })
            .await
            .is_err()
        {
            // Monitor already finished; it publishes the exit before returning
            return self.wait().await;
        }

        match response.await {
            Ok(result) => result,
            Err(_) => self.wait().await,
        }
    }

    /// Wait until the process exits.
    pub async fn wait(&self) -> Result<VmExit> {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(|e| e.is_some()).await;
        match result {
            Ok(status) => Ok(status.unwrap_or_else(VmExit::unknown)),
            Err(_) => Err(Error::process(
                "wait",
                format!("{}: supervisor ended without reporting an exit", self.vm_id),
            )),
        }
    }
}

/// A launched hypervisor and its log drains.
#[derive(Debug)]
pub struct Launched {
    /// Control handle.
    pub handle: HypervisorHandle,
    /// Log and metrics drain tasks.
    pub logs: LogTasks,
}

/// Starts hypervisor processes.
pub trait VmmLauncher: Send + Sync {
    /// Launch a VM and wait out its startup grace period.
    fn launch<'a>(
        &'a self,
        identity: &'a VmIdentity,
        lease: &'a NetworkLease,
    ) -> BoxFuture<'a, Result<Launched>>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_paths_layout() {
        let paths = VmPaths::new(Path::new("/var/vms"), Path::new("fc-logs"), "vm-1");
        assert_eq!(paths.socket, PathBuf::from("/var/vms/vm-1"));
        assert_eq!(paths.config_file, PathBuf::from("/var/vms/vm-1.json"));
        assert_eq!(paths.log_fifo, PathBuf::from("fc-logs/vm-1.fifo"));
        assert_eq!(paths.metrics_fifo, PathBuf::from("fc-logs/vm-1-metrics.fifo"));
        assert_eq!(paths.log_file, PathBuf::from("fc-logs/vm-1.log"));
        assert_eq!(paths.metrics_file, PathBuf::from("fc-logs/vm-1-metrics.log"));
    }

    #[tokio::test]
    async fn test_handle_reports_exit_after_monitor_ends() {
        let (control, requests) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = HypervisorHandle::new("vm-1".into(), None, PathBuf::new(), control, exit_rx);

        assert!(!handle.has_exited());
        let exit = VmExit {
            code: 3,
            signal: None,
            forced: false,
        };
        exit_tx.send_replace(Some(exit));
        drop(requests);

        assert!(handle.has_exited());
        assert_eq!(handle.stop(false).await.unwrap(), exit);
        assert_eq!(handle.wait().await.unwrap(), exit);
    }

    #[tokio::test]
    async fn test_wait_errors_when_monitor_vanishes() {
        let (control, _requests) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = HypervisorHandle::new("vm-1".into(), None, PathBuf::new(), control, exit_rx);
        drop(exit_tx);

        assert!(matches!(handle.wait().await, Err(Error::Process { .. })));
    }
}
