//! Per-VM network identity: tap device, bridge attachment, IP and MAC.
//!
//! Each VM gets a tap device named `<prefix>-<last 6 chars of id>` attached to
//! the node's bridge. Guest addressing is static: the lease is passed to the
//! kernel through the `ip=` boot argument, with the bridge as gateway.

pub mod ipam;

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;

use crate::command::CommandRunner;
use crate::config::{NetworkSettings, TAP_SUFFIX_LEN};
use crate::error::{Error, Result};

pub use ipam::{IpAllocator, ScanMode, Subnet};

/// Derive the tap device name for a VM.
///
/// Pure function of its inputs: `("fc", "abcdef0123456789")` is `"fc-456789"`.
/// Ids shorter than the suffix are used whole.
pub fn tap_device_name(prefix: &str, vm_id: &str) -> String {
    let chars: Vec<char> = vm_id.chars().collect();
    let start = chars.len().saturating_sub(TAP_SUFFIX_LEN);
    let suffix: String = chars[start..].iter().collect();
    format!("{}-{}", prefix, suffix)
}

/// Random locally-administered unicast MAC address.
pub fn generate_mac_address() -> String {
    let mut buf: [u8; 6] = rand::random();
    // Locally administered, not multicast
    buf[0] = (buf[0] | 0x02) & 0xfe;
    buf.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// The bridge's own address and the subnet it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeAddress {
    /// Bridge interface name.
    pub name: String,
    /// Address assigned to the bridge; the guests' gateway.
    pub address: Ipv4Addr,
    /// Subnet the bridge address belongs to.
    pub subnet: Subnet,
}

/// Parse `ip -o -4 addr show dev <bridge>` output.
pub fn parse_bridge_address(bridge: &str, output: &str) -> Result<BridgeAddress> {
    let cidr = output
        .lines()
        .flat_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            fields
                .iter()
                .position(|f| *f == "inet")
                .and_then(|i| fields.get(i + 1).map(|s| s.to_string()))
        })
        .next()
        .ok_or_else(|| {
            Error::network(
                "resolve bridge",
                format!("bridge {} has no IPv4 address", bridge),
            )
        })?;

    let (address, subnet) = Subnet::parse_cidr(&cidr)?;
    Ok(BridgeAddress {
        name: bridge.to_string(),
        address,
        subnet,
    })
}

/// Network identity handed to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkLease {
    /// Host-side tap device.
    pub tap_device: String,
    /// Guest address.
    pub ip_address: Ipv4Addr,
    /// Bridge address, used as the guest gateway.
    pub bridge_address: Ipv4Addr,
    /// Guest netmask.
    pub netmask: Ipv4Addr,
    /// Guest prefix length.
    pub prefix_len: u8,
    /// Guest MAC address.
    pub mac_address: String,
}

impl NetworkLease {
    /// Kernel `ip=` autoconfiguration argument for `eth0`.
    pub fn kernel_ip_arg(&self) -> String {
        format!(
            "ip={}::{}:{}::eth0:off",
            self.ip_address, self.bridge_address, self.netmask
        )
    }
}

/// Creates and removes tap devices and leases their addresses.
pub struct NetworkProvisioner {
    runner: Arc<dyn CommandRunner>,
    allocator: Arc<IpAllocator>,
    bridge: String,
    tap_prefix: String,
}

impl NetworkProvisioner {
    /// Create a provisioner for the configured bridge.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        allocator: Arc<IpAllocator>,
        settings: &NetworkSettings,
    ) -> Self {
        Self {
            runner,
            allocator,
            bridge: settings.bridge.clone(),
            tap_prefix: settings.tap_prefix.clone(),
        }
    }

    /// Tap device name this provisioner uses for `vm_id`.
    pub fn tap_name(&self, vm_id: &str) -> String {
        tap_device_name(&self.tap_prefix, vm_id)
    }

    /// Look up the bridge's address. Fails if the bridge does not exist.
    pub fn bridge_address(&self) -> Result<BridgeAddress> {
        let output = self
            .runner
            .run("ip", &["-o", "-4", "addr", "show", "dev", &self.bridge])
            .map_err(|e| Error::network("resolve bridge", format!("{}: {}", self.bridge, e)))?;
        parse_bridge_address(&self.bridge, &output)
    }

    /// Create, attach and address a tap device for `vm_id`.
    ///
    /// Blocking. A failure after the device was created deletes it again.
    pub fn allocate(&self, vm_id: &str) -> Result<NetworkLease> {
        let bridge = self.bridge_address()?;
        let tap = self.tap_name(vm_id);

        self.run_step("create tap device", &tap, &["tuntap", "add", &tap, "mode", "tap"])?;

        let lease = self.configure(&tap, &bridge).map_err(|e| {
            self.delete_device(&tap);
            e
        })?;

        tracing::info!(
            vm = %vm_id,
            tap = %lease.tap_device,
            ip = %lease.ip_address,
            mac = %lease.mac_address,
            "network allocated"
        );
        Ok(lease)
    }

    fn configure(&self, tap: &str, bridge: &BridgeAddress) -> Result<NetworkLease> {
        self.run_step("bring tap device up", tap, &["link", "set", tap, "up"])?;
        self.run_step(
            "attach tap device to bridge",
            tap,
            &["link", "set", tap, "master", &bridge.name],
        )?;

        let ip_address = self.allocator.allocate(bridge.address, bridge.subnet)?;

        Ok(NetworkLease {
            tap_device: tap.to_string(),
            ip_address,
            bridge_address: bridge.address,
            netmask: bridge.subnet.netmask(),
            prefix_len: bridge.subnet.prefix_len(),
            mac_address: generate_mac_address(),
        })
    }

    /// Addresses leased through this provisioner.
    #[cfg(test)]
    pub(crate) fn leased_addresses(&self) -> Vec<Ipv4Addr> {
        self.allocator.leased()
    }

    /// Delete the lease's tap device and return its address to the pool.
    ///
    /// The address is released even if device deletion fails; the error is
    /// returned for the caller to log.
    pub fn release(&self, lease: &NetworkLease) -> Result<()> {
        self.allocator.release(lease.ip_address);
        self.run_step(
            "delete tap device",
            &lease.tap_device,
            &["link", "del", &lease.tap_device],
        )?;
        tracing::info!(tap = %lease.tap_device, ip = %lease.ip_address, "network released");
        Ok(())
    }

    fn run_step(&self, operation: &str, tap: &str, args: &[&str]) -> Result<String> {
        self.runner
            .run("ip", args)
            .map_err(|e| Error::network(operation, format!("{}: {}", tap, e)))
    }

    fn delete_device(&self, tap: &str) {
        if let Err(e) = self.runner.run("ip", &["link", "del", tap]) {
            tracing::warn!(tap = %tap, error = %e, "failed to roll back tap device");
        } else {
            tracing::debug!(tap = %tap, "rolled back tap device");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;

    const BRIDGE_OUTPUT: &str = "5: fcbridge    inet 172.16.0.1/24 brd 172.16.0.255 scope global fcbridge\\       valid_lft forever preferred_lft forever";

    fn provisioner(runner: Arc<ScriptedRunner>) -> NetworkProvisioner {
        let allocator = Arc::new(IpAllocator::new(runner.clone(), ScanMode::Subnet));
        NetworkProvisioner::new(runner, allocator, &NetworkSettings::default())
    }

    #[test]
    fn test_tap_device_name_is_pure() {
        assert_eq!(tap_device_name("fc", "abcdef0123456789"), "fc-456789");
        assert_eq!(tap_device_name("fc", "abcdef0123456789"), "fc-456789");
        assert_eq!(tap_device_name("fc", "vm-1"), "fc-vm-1");
        assert!(tap_device_name("fc", "00000000-0000-0000-0000-000000000000").len() <= 15);
    }

    #[test]
    fn test_mac_address_format() {
        for _ in 0..32 {
            let mac = generate_mac_address();
            let octets: Vec<u8> = mac
                .split(':')
                .map(|o| u8::from_str_radix(o, 16).unwrap())
                .collect();
            assert_eq!(octets.len(), 6);
            assert_eq!(mac.len(), 17);
            assert_eq!(octets[0] & 0x02, 0x02, "locally administered bit: {}", mac);
            assert_eq!(octets[0] & 0x01, 0x00, "multicast bit: {}", mac);
        }
    }

    #[test]
    fn test_parse_bridge_address() {
        let bridge = parse_bridge_address("fcbridge", BRIDGE_OUTPUT).unwrap();
        assert_eq!(bridge.address, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(bridge.subnet.to_string(), "172.16.0.0/24");

        let err = parse_bridge_address("fcbridge", "").unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }

    #[test]
    fn test_kernel_ip_arg() {
        let lease = NetworkLease {
            tap_device: "fc-vm-1".into(),
            ip_address: Ipv4Addr::new(172, 16, 0, 5),
            bridge_address: Ipv4Addr::new(172, 16, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            prefix_len: 24,
            mac_address: "02:00:00:00:00:01".into(),
        };
        assert_eq!(
            lease.kernel_ip_arg(),
            "ip=172.16.0.5::172.16.0.1:255.255.255.0::eth0:off"
        );
    }

    #[test]
    fn test_allocate_runs_commands_in_order() {
        let runner = Arc::new(ScriptedRunner::new().on("ip -o -4 addr", BRIDGE_OUTPUT));
        let net = provisioner(runner.clone());

        let lease = net.allocate("abcdef0123456789").unwrap();
        assert_eq!(lease.tap_device, "fc-456789");
        assert_eq!(lease.bridge_address, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(lease.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_ne!(lease.ip_address, lease.bridge_address);

        assert_eq!(
            runner.calls(),
            vec![
                "ip -o -4 addr show dev fcbridge",
                "ip tuntap add fc-456789 mode tap",
                "ip link set fc-456789 up",
                "ip link set fc-456789 master fcbridge",
            ]
        );
    }

    #[test]
    fn test_missing_bridge_creates_nothing() {
        let runner = Arc::new(
            ScriptedRunner::new().fail("ip -o -4 addr", "Device \"fcbridge\" does not exist."),
        );
        let net = provisioner(runner.clone());

        let err = net.allocate("vm-1").unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
        assert!(err.to_string().contains("fcbridge"));
        assert!(runner.calls_matching("ip tuntap").is_empty());
    }

    #[test]
    fn test_attach_failure_rolls_back_device() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("ip -o -4 addr", BRIDGE_OUTPUT)
                .fail("ip link set fc-vm-1 master", "no such bridge"),
        );
        let net = provisioner(runner.clone());

        let err = net.allocate("vm-1").unwrap_err();
        assert!(err.to_string().contains("attach tap device"));
        assert_eq!(runner.calls_matching("ip link del"), vec!["ip link del fc-vm-1"]);
    }

    #[test]
    fn test_release_deletes_device_and_frees_ip() {
        let runner = Arc::new(ScriptedRunner::new().on("ip -o -4 addr", BRIDGE_OUTPUT));
        let allocator = Arc::new(IpAllocator::new(runner.clone(), ScanMode::Subnet));
        let net = NetworkProvisioner::new(runner.clone(), allocator.clone(), &NetworkSettings::default());

        let lease = net.allocate("vm-1").unwrap();
        assert_eq!(allocator.leased(), vec![lease.ip_address]);

        net.release(&lease).unwrap();
        assert!(allocator.leased().is_empty());
        assert_eq!(runner.calls_matching("ip link del"), vec!["ip link del fc-vm-1"]);
    }

    #[test]
    fn test_release_failure_still_frees_ip() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("ip -o -4 addr", BRIDGE_OUTPUT)
                .fail("ip link del", "Cannot find device"),
        );
        let allocator = Arc::new(IpAllocator::new(runner.clone(), ScanMode::Subnet));
        let net = NetworkProvisioner::new(runner, allocator.clone(), &NetworkSettings::default());

        let lease = net.allocate("vm-1").unwrap();
        assert!(net.release(&lease).is_err());
        assert!(allocator.leased().is_empty());
    }
}
