//! Firecracker `--config-file` document.

use serde::Serialize;

use super::{VmIdentity, VmPaths};
use crate::config::HypervisorSettings;
use crate::error::{Error, Result};
use crate::network::NetworkLease;

/// Drive id of the root drive.
pub const ROOT_DRIVE_ID: &str = "1";

/// Guest interface name.
pub const GUEST_IFACE: &str = "eth0";

/// Full boot configuration passed to the hypervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HypervisorConfig {
    #[serde(rename = "boot-source")]
    boot_source: BootSource,
    drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    machine_config: MachineConfig,
    #[serde(rename = "network-interfaces")]
    network_interfaces: Vec<NetworkInterface>,
    logger: Logger,
    metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct BootSource {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Drive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct MachineConfig {
    vcpu_count: u8,
    mem_size_mib: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct NetworkInterface {
    iface_id: String,
    guest_mac: String,
    host_dev_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Logger {
    log_path: String,
    level: String,
    show_level: bool,
    show_log_origin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Metrics {
    metrics_path: String,
}

impl HypervisorConfig {
    /// Assemble the configuration for one VM.
    pub fn build(
        identity: &VmIdentity,
        lease: &NetworkLease,
        paths: &VmPaths,
        settings: &HypervisorSettings,
    ) -> Self {
        let boot_args = format!("{} {}", settings.boot_args.trim(), lease.kernel_ip_arg());
        Self {
            boot_source: BootSource {
                kernel_image_path: identity.kernel_image_path.display().to_string(),
                boot_args: boot_args.trim().to_string(),
            },
            drives: vec![Drive {
                drive_id: ROOT_DRIVE_ID.to_string(),
                path_on_host: identity.root_drive_path.display().to_string(),
                is_root_device: true,
                is_read_only: false,
            }],
            machine_config: MachineConfig {
                vcpu_count: identity.vcpu_count,
                mem_size_mib: identity.memory_mib,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: GUEST_IFACE.to_string(),
                guest_mac: lease.mac_address.clone(),
                host_dev_name: lease.tap_device.clone(),
            }],
            logger: Logger {
                log_path: paths.log_fifo.display().to_string(),
                level: settings.log_level.clone(),
                show_level: true,
                show_log_origin: true,
            },
            metrics: Metrics {
                metrics_path: paths.metrics_fifo.display().to_string(),
            },
        }
    }

    /// Kernel command line.
    pub fn boot_args(&self) -> &str {
        &self.boot_source.boot_args
    }

    /// Pretty-printed JSON document.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::process("write config", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::{Path, PathBuf};

    fn fixture() -> (VmIdentity, NetworkLease, VmPaths) {
        let identity = VmIdentity {
            id: "vm-abc123".into(),
            kernel_image_path: PathBuf::from("/boot/vmlinux"),
            root_drive_path: PathBuf::from("/var/lib/catapult/images/alpine/rootfs.ext4"),
            vcpu_count: 2,
            memory_mib: 512,
        };
        let lease = NetworkLease {
            tap_device: "fc-abc123".into(),
            ip_address: Ipv4Addr::new(10, 0, 0, 7),
            bridge_address: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            prefix_len: 24,
            mac_address: "02:aa:bb:cc:dd:ee".into(),
        };
        let paths = VmPaths::new(Path::new("/var/vms"), Path::new("/var/log/fc"), "vm-abc123");
        (identity, lease, paths)
    }

    #[test]
    fn test_config_document_shape() {
        let (identity, lease, paths) = fixture();
        let config =
            HypervisorConfig::build(&identity, &lease, &paths, &HypervisorSettings::default());
        let json: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();

        assert_eq!(json["boot-source"]["kernel_image_path"], "/boot/vmlinux");
        assert_eq!(json["drives"][0]["drive_id"], "1");
        assert_eq!(json["drives"][0]["is_root_device"], true);
        assert_eq!(json["drives"][0]["is_read_only"], false);
        assert_eq!(
            json["drives"][0]["path_on_host"],
            "/var/lib/catapult/images/alpine/rootfs.ext4"
        );
        assert_eq!(json["machine-config"]["vcpu_count"], 2);
        assert_eq!(json["machine-config"]["mem_size_mib"], 512);
        assert_eq!(json["network-interfaces"][0]["iface_id"], "eth0");
        assert_eq!(json["network-interfaces"][0]["host_dev_name"], "fc-abc123");
        assert_eq!(json["network-interfaces"][0]["guest_mac"], "02:aa:bb:cc:dd:ee");
        assert_eq!(json["logger"]["log_path"], "/var/log/fc/vm-abc123.fifo");
        assert_eq!(json["logger"]["level"], "Debug");
        assert_eq!(
            json["metrics"]["metrics_path"],
            "/var/log/fc/vm-abc123-metrics.fifo"
        );
    }

    #[test]
    fn test_boot_args_carry_network_identity() {
        let (identity, lease, paths) = fixture();
        let config =
            HypervisorConfig::build(&identity, &lease, &paths, &HypervisorSettings::default());
        assert_eq!(
            config.boot_args(),
            "console=ttyS0 reboot=k panic=1 pci=off ip=10.0.0.7::10.0.0.1:255.255.255.0::eth0:off"
        );
    }

    #[test]
    fn test_custom_log_level() {
        let (identity, lease, paths) = fixture();
        let settings = HypervisorSettings {
            log_level: "Warning".into(),
            ..HypervisorSettings::default()
        };
        let config = HypervisorConfig::build(&identity, &lease, &paths, &settings);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["logger"]["level"], "Warning");
    }
}
