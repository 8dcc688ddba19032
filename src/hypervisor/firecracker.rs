//! Firecracker process launcher and monitor.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, watch};

use super::config::HypervisorConfig;
use super::logs::{make_fifo, spawn_drain, LogTasks};
use super::{api, BoxFuture, HypervisorHandle, Launched, StopRequest, VmIdentity, VmPaths, VmmLauncher};
use crate::config::HypervisorSettings;
use crate::error::{Error, Result};
use crate::network::NetworkLease;
use crate::process::{self, VmExit};

/// How long stop joins the drains before aborting them.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches one Firecracker process per VM.
pub struct FirecrackerLauncher {
    settings: HypervisorSettings,
}

impl FirecrackerLauncher {
    /// Create a launcher.
    pub fn new(settings: HypervisorSettings) -> Self {
        Self { settings }
    }

    /// Settings in use.
    pub fn settings(&self) -> &HypervisorSettings {
        &self.settings
    }

    /// Resolve the hypervisor binary, failing if it does not exist.
    pub fn check_binary(&self) -> Result<PathBuf> {
        let binary = &self.settings.binary;
        if binary.is_file() {
            return Ok(binary.clone());
        }
        if !binary.to_string_lossy().contains('/') {
            if let Some(found) = crate::command::find_tool(&binary.to_string_lossy()) {
                return Ok(PathBuf::from(found));
            }
        }
        Err(Error::configuration(
            "hypervisor binary",
            format!("{} not found", binary.display()),
        ))
    }

    async fn launch_vm(&self, identity: &VmIdentity, lease: &NetworkLease) -> Result<Launched> {
        let binary = self.check_binary()?;
        require_file("kernel image", &identity.kernel_image_path)?;
        require_file("root drive", &identity.root_drive_path)?;

        let paths = VmPaths::new(&self.settings.vm_data_dir, &self.settings.log_dir, &identity.id);
        self.prepare(identity, lease, &paths)?;

        let logs = LogTasks::new(vec![paths.log_file.clone(), paths.metrics_file.clone()]);
        let poll = self.settings.log_poll_interval();
        logs.push(spawn_drain(
            paths.log_fifo.clone(),
            paths.log_file.clone(),
            poll,
            logs.subscribe(),
        ));
        logs.push(spawn_drain(
            paths.metrics_fifo.clone(),
            paths.metrics_file.clone(),
            poll,
            logs.subscribe(),
        ));

        let mut child = match spawn(&binary, &paths) {
            Ok(child) => child,
            Err(e) => {
                logs.shutdown(DRAIN_JOIN_TIMEOUT).await;
                return Err(e);
            }
        };
        let pid = child.id();
        tracing::info!(vm = %identity.id, pid = ?pid, tap = %lease.tap_device, "hypervisor spawned");

        // Early exit inside the grace period counts as a failed start
        if let Ok(status) = tokio::time::timeout(self.settings.startup_grace(), child.wait()).await {
            logs.shutdown(DRAIN_JOIN_TIMEOUT).await;
            let _ = fs::remove_file(&paths.socket);
            let reason = match status {
                Ok(status) => format!(
                    "exited during startup ({}); see {}",
                    VmExit::from_status(status, false),
                    paths.console_log.display()
                ),
                Err(e) => format!("failed to wait for hypervisor: {}", e),
            };
            return Err(Error::process("startup", reason));
        }
        tracing::info!(vm = %identity.id, "no errors after grace period, assuming vm started");

        let (control, requests) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(
            child,
            identity.id.clone(),
            paths.socket.clone(),
            self.settings.stop_timeout(),
            requests,
            exit_tx,
        ));

        Ok(Launched {
            handle: HypervisorHandle::new(identity.id.clone(), pid, paths.socket, control, exit_rx),
            logs,
        })
    }

    fn prepare(&self, identity: &VmIdentity, lease: &NetworkLease, paths: &VmPaths) -> Result<()> {
        fs::create_dir_all(&self.settings.vm_data_dir)
            .map_err(|e| prep(self.settings.vm_data_dir.display(), e))?;
        fs::create_dir_all(&self.settings.log_dir)
            .map_err(|e| prep(self.settings.log_dir.display(), e))?;

        match fs::remove_file(&paths.socket) {
            Ok(()) => tracing::debug!(socket = %paths.socket.display(), "removed stale api socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(prep("stale api socket", e)),
        }

        let config = HypervisorConfig::build(identity, lease, paths, &self.settings);
        fs::write(&paths.config_file, config.to_json()?)
            .map_err(|e| prep(paths.config_file.display(), e))?;
        tracing::debug!(vm = %identity.id, boot_args = %config.boot_args(), "wrote hypervisor config");

        make_fifo(&paths.log_fifo).map_err(|e| prep("log fifo", e))?;
        make_fifo(&paths.metrics_fifo).map_err(|e| prep("metrics fifo", e))?;
        Ok(())
    }
}

impl VmmLauncher for FirecrackerLauncher {
    fn launch<'a>(
        &'a self,
        identity: &'a VmIdentity,
        lease: &'a NetworkLease,
    ) -> BoxFuture<'a, Result<Launched>> {
        Box::pin(self.launch_vm(identity, lease))
    }
}

fn prep(what: impl std::fmt::Display, e: std::io::Error) -> Error {
    Error::process("prepare", format!("{}: {}", what, e))
}

fn require_file(what: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::configuration(
            what,
            format!("{} does not exist", path.display()),
        ))
    }
}

fn spawn(binary: &Path, paths: &VmPaths) -> Result<Child> {
    let console = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.console_log)
        .map_err(|e| Error::process("spawn", format!("{}: {}", paths.console_log.display(), e)))?;
    let console_err = console
        .try_clone()
        .map_err(|e| Error::process("spawn", e.to_string()))?;

    Command::new(binary)
        .arg("--api-sock")
        .arg(&paths.socket)
        .arg("--config-file")
        .arg(&paths.config_file)
        .stdin(Stdio::null())
        .stdout(Stdio::from(console))
        .stderr(Stdio::from(console_err))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::process("spawn", format!("{}: {}", binary.display(), e)))
}

/// Owns the child until it exits, serving stop requests and node signals.
async fn monitor(
    mut child: Child,
    vm_id: String,
    socket: PathBuf,
    stop_timeout: Duration,
    mut requests: mpsc::Receiver<StopRequest>,
    exit_tx: watch::Sender<Option<VmExit>>,
) {
    let mut sigint = register(SignalKind::interrupt());
    let mut sigterm = register(SignalKind::terminate());
    let mut sigquit = register(SignalKind::quit());

    let (outcome, reply) = tokio::select! {
        status = child.wait() => {
            let exit = match status {
                Ok(status) => VmExit::from_status(status, false),
                Err(_) => VmExit::unknown(),
            };
            tracing::warn!(vm = %vm_id, exit = %exit, "hypervisor exited");
            (Ok(exit), None)
        }
        req = requests.recv() => match req {
            Some(StopRequest { force, reply }) => {
                (shutdown(&mut child, &vm_id, &socket, stop_timeout, force).await, Some(reply))
            }
            // Handle dropped while the process was running
            None => (shutdown(&mut child, &vm_id, &socket, stop_timeout, true).await, None),
        },
        _ = next_signal(&mut sigint) => {
            tracing::info!(vm = %vm_id, "SIGINT received, stopping vm");
            (shutdown(&mut child, &vm_id, &socket, stop_timeout, false).await, None)
        }
        _ = next_signal(&mut sigterm) => {
            tracing::info!(vm = %vm_id, "SIGTERM received, stopping vm");
            (shutdown(&mut child, &vm_id, &socket, stop_timeout, false).await, None)
        }
        _ = next_signal(&mut sigquit) => {
            tracing::info!(vm = %vm_id, "SIGQUIT received, killing vm");
            (shutdown(&mut child, &vm_id, &socket, stop_timeout, true).await, None)
        }
    };

    let _ = fs::remove_file(&socket);
    publish(&exit_tx, &outcome);
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}

fn publish(exit_tx: &watch::Sender<Option<VmExit>>, outcome: &Result<VmExit>) {
    let exit = match outcome {
        Ok(exit) => *exit,
        Err(_) => VmExit::unknown(),
    };
    exit_tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(exit);
            true
        } else {
            false
        }
    });
}

fn register(kind: SignalKind) -> Option<Signal> {
    match signal(kind) {
        Ok(sig) => Some(sig),
        Err(e) => {
            tracing::warn!(error = %e, "failed to register signal handler");
            None
        }
    }
}

async fn next_signal(sig: &mut Option<Signal>) {
    if let Some(s) = sig {
        if s.recv().await.is_some() {
            return;
        }
        *sig = None;
    }
    std::future::pending::<()>().await
}

/// Stop the child: Ctrl+Alt+Del (or SIGTERM) first, SIGKILL after the timeout.
async fn shutdown(
    child: &mut Child,
    vm_id: &str,
    socket: &Path,
    stop_timeout: Duration,
    force: bool,
) -> Result<VmExit> {
    if !force {
        match api::send_ctrl_alt_del(socket).await {
            Ok(()) => tracing::info!(vm = %vm_id, "requested guest shutdown"),
            Err(e) => {
                tracing::warn!(vm = %vm_id, error = %e, "api shutdown failed, sending SIGTERM");
                if let Some(pid) = child.id() {
                    process::terminate(pid as libc::pid_t);
                }
            }
        }

        match tokio::time::timeout(stop_timeout, child.wait()).await {
            Ok(Ok(status)) => return Ok(VmExit::from_status(status, false)),
            Ok(Err(e)) => return Err(Error::process("stop", format!("{}: {}", vm_id, e))),
            Err(_) => {
                tracing::warn!(vm = %vm_id, timeout = ?stop_timeout, "graceful stop timed out, killing")
            }
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(vm = %vm_id, error = %e, "kill failed, process may already be gone");
    }
    let status = child
        .wait()
        .await
        .map_err(|e| Error::process("stop", format!("{}: {}", vm_id, e)))?;
    Ok(VmExit::from_status(status, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        identity: VmIdentity,
        lease: NetworkLease,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let kernel = dir.path().join("vmlinux");
            let drive = dir.path().join("rootfs.ext4");
            fs::write(&kernel, b"kernel").unwrap();
            fs::write(&drive, b"drive").unwrap();
            Self {
                identity: VmIdentity {
                    id: "vm-test01".into(),
                    kernel_image_path: kernel,
                    root_drive_path: drive,
                    vcpu_count: 1,
                    memory_mib: 128,
                },
                lease: NetworkLease {
                    tap_device: "fc-test01".into(),
                    ip_address: Ipv4Addr::new(10, 0, 0, 5),
                    bridge_address: Ipv4Addr::new(10, 0, 0, 1),
                    netmask: Ipv4Addr::new(255, 255, 255, 0),
                    prefix_len: 24,
                    mac_address: "02:00:00:00:00:05".into(),
                },
                dir,
            }
        }

        fn settings(&self, script: &str) -> HypervisorSettings {
            let binary = self.dir.path().join("fake-firecracker");
            fs::write(&binary, format!("#!/bin/sh\n{}\n", script)).unwrap();
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
            HypervisorSettings {
                binary,
                vm_data_dir: self.dir.path().join("vms"),
                log_dir: self.dir.path().join("logs"),
                startup_grace_ms: 200,
                stop_timeout_secs: 1,
                log_poll_interval_ms: 10,
                ..HypervisorSettings::default()
            }
        }

        fn paths(&self) -> VmPaths {
            VmPaths::new(
                &self.dir.path().join("vms"),
                &self.dir.path().join("logs"),
                &self.identity.id,
            )
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration_error() {
        let fx = Fixture::new();
        let launcher = FirecrackerLauncher::new(HypervisorSettings {
            binary: fx.dir.path().join("nope"),
            ..HypervisorSettings::default()
        });
        let err = launcher.launch(&fx.identity, &fx.lease).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_missing_kernel_is_configuration_error() {
        let mut fx = Fixture::new();
        fx.identity.kernel_image_path = fx.dir.path().join("missing-vmlinux");
        let launcher = FirecrackerLauncher::new(fx.settings("exec sleep 30"));
        let err = launcher.launch(&fx.identity, &fx.lease).await.unwrap_err();
        assert!(err.to_string().contains("kernel image"));
    }

    #[tokio::test]
    async fn test_early_exit_fails_startup() {
        let fx = Fixture::new();
        let launcher = FirecrackerLauncher::new(fx.settings("echo 'bad config' >&2; exit 1"));

        let err = launcher.launch(&fx.identity, &fx.lease).await.unwrap_err();
        assert!(matches!(err, Error::Process { ref operation, .. } if operation == "startup"));

        let console = fs::read_to_string(fx.paths().console_log).unwrap();
        assert!(console.contains("bad config"));
    }

    #[tokio::test]
    async fn test_launch_writes_config_and_passes_args() {
        let fx = Fixture::new();
        let args_file = fx.dir.path().join("args");
        let launcher = FirecrackerLauncher::new(
            fx.settings(&format!("echo \"$@\" > {}; exec sleep 30", args_file.display())),
        );

        let launched = launcher.launch(&fx.identity, &fx.lease).await.unwrap();
        let paths = fx.paths();

        let args = fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            args.trim(),
            format!(
                "--api-sock {} --config-file {}",
                paths.socket.display(),
                paths.config_file.display()
            )
        );
        let config: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.config_file).unwrap()).unwrap();
        assert_eq!(config["network-interfaces"][0]["host_dev_name"], "fc-test01");
        assert!(launched.handle.pid().is_some());

        launched.handle.stop(true).await.unwrap();
        launched.logs.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_graceful_stop_falls_back_to_sigterm() {
        let fx = Fixture::new();
        let launcher = FirecrackerLauncher::new(fx.settings("exec sleep 30"));
        let launched = launcher.launch(&fx.identity, &fx.lease).await.unwrap();

        let exit = launched.handle.stop(false).await.unwrap();
        assert_eq!(exit.signal, Some(libc::SIGTERM));
        assert!(!exit.forced);
        assert!(launched.handle.has_exited());
        launched.logs.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let fx = Fixture::new();
        let launcher = FirecrackerLauncher::new(
            fx.settings("trap '' TERM; while true; do sleep 0.1; done"),
        );
        let launched = launcher.launch(&fx.identity, &fx.lease).await.unwrap();

        let exit = launched.handle.stop(false).await.unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert!(exit.forced);
        launched.logs.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_force_stop() {
        let fx = Fixture::new();
        let launcher = FirecrackerLauncher::new(fx.settings("exec sleep 30"));
        let launched = launcher.launch(&fx.identity, &fx.lease).await.unwrap();

        let exit = launched.handle.stop(true).await.unwrap();
        assert!(exit.forced);
        assert_eq!(launched.handle.stop(true).await.unwrap(), exit);
        launched.logs.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_observed() {
        let fx = Fixture::new();
        let launcher = FirecrackerLauncher::new(fx.settings("sleep 0.5; exit 7"));
        let launched = launcher.launch(&fx.identity, &fx.lease).await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), launched.handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, 7);
        assert!(!exit.forced);
        launched.logs.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_hypervisor_log_lines_are_drained() {
        let fx = Fixture::new();
        let paths = fx.paths();
        let launcher = FirecrackerLauncher::new(fx.settings(&format!(
            "echo 'vmm booted' > {}; exec sleep 30",
            paths.log_fifo.display()
        )));
        let launched = launcher.launch(&fx.identity, &fx.lease).await.unwrap();

        let mut contents = String::new();
        for _ in 0..100 {
            contents = fs::read_to_string(&paths.log_file).unwrap_or_default();
            if contents.contains("vmm booted") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(contents, "vmm booted\n");

        launched.handle.stop(true).await.unwrap();
        launched.logs.shutdown(Duration::from_secs(1)).await;
    }
}
