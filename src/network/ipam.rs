//! IPv4 address allocation on the VM bridge.
//!
//! The [`IpAllocator`] owns the pool of candidate addresses behind a single
//! mutex, so a scan and the pick that follows it are atomic with respect to
//! other allocations. Addresses discovered by a scan but not yet handed out
//! are cached and consumed before the next scan.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::command::CommandRunner;
use crate::error::{Error, Result};

/// Number of leading scan results treated as reserved (network and gateway).
const RESERVED_LEADING_ADDRESSES: usize = 2;

/// How free addresses are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Ping-scan the subnet with `nmap` and use hosts reported down.
    #[default]
    Nmap,
    /// Enumerate the subnet without probing. Only safe when the node owns it.
    Subnet,
}

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Build the subnet containing `addr`.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(Error::network(
                "parse subnet",
                format!("invalid prefix length: {}", prefix_len),
            ));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask_bits(prefix_len));
        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// Parse `a.b.c.d/len`, returning the address and its subnet.
    pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, Self)> {
        let (addr, len) = cidr
            .split_once('/')
            .ok_or_else(|| Error::network("parse subnet", format!("not a CIDR: {}", cidr)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::network("parse subnet", format!("invalid address: {}", cidr)))?;
        let len: u8 = len
            .parse()
            .map_err(|_| Error::network("parse subnet", format!("invalid prefix: {}", cidr)))?;
        Ok((addr, Self::new(addr, len)?))
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Dotted netmask.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.prefix_len))
    }

    /// Broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask_bits(self.prefix_len))
    }

    /// Whether `addr` lies inside the subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_bits(self.prefix_len) == u32::from(self.network)
    }

}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn mask_bits(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n)),
    }
}

/// Extract the addresses nmap reported as down from `-oG -` output.
///
/// Lines look like `Host: 10.0.0.7 ()\tStatus: Down`.
pub fn parse_nmap_down_hosts(output: &str) -> Vec<Ipv4Addr> {
    output
        .lines()
        .filter(|line| line.contains("Status: Down"))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("Host:") => fields.next()?.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

#[derive(Debug, Default)]
struct PoolState {
    subnet: Option<Subnet>,
    candidates: VecDeque<Ipv4Addr>,
    leased: HashSet<Ipv4Addr>,
    /// Next address the subnet walk will try.
    cursor: Option<u32>,
}

/// Serialized allocator for addresses on one bridge subnet.
pub struct IpAllocator {
    runner: Arc<dyn CommandRunner>,
    mode: ScanMode,
    pool: Mutex<PoolState>,
}

impl IpAllocator {
    /// Create an allocator that scans with `mode`.
    pub fn new(runner: Arc<dyn CommandRunner>, mode: ScanMode) -> Self {
        Self {
            runner,
            mode,
            pool: Mutex::new(PoolState::default()),
        }
    }

    /// Lease a free address in the bridge's subnet.
    ///
    /// Blocks for the duration of a scan when the cache is empty; call from
    /// a blocking context.
    pub fn allocate(&self, bridge_ip: Ipv4Addr, subnet: Subnet) -> Result<Ipv4Addr> {
        let mut pool = self.pool.lock();

        if pool.subnet != Some(subnet) {
            if pool.subnet.is_some() {
                tracing::info!(subnet = %subnet, "bridge subnet changed, dropping cached addresses");
            }
            pool.subnet = Some(subnet);
            pool.candidates.clear();
            pool.cursor = None;
        }

        if let Some(ip) = take_usable(&mut pool, bridge_ip, subnet) {
            tracing::debug!(ip = %ip, "allocated cached address");
            return Ok(ip);
        }

        let allocated = match self.mode {
            ScanMode::Subnet => walk_subnet(&mut pool, bridge_ip, subnet),
            ScanMode::Nmap => {
                let scanned = self.scan_nmap(subnet)?;
                let scanned_count = scanned.len();
                pool.candidates = scanned
                    .into_iter()
                    .skip(RESERVED_LEADING_ADDRESSES)
                    .collect();
                tracing::debug!(
                    subnet = %subnet,
                    scanned = scanned_count,
                    candidates = pool.candidates.len(),
                    "refreshed address cache"
                );
                take_usable(&mut pool, bridge_ip, subnet)
            }
        };

        match allocated {
            Some(ip) => {
                tracing::debug!(ip = %ip, "allocated address");
                Ok(ip)
            }
            None => Err(Error::network(
                "allocate ip",
                format!("no free address in {}", subnet),
            )),
        }
    }

    /// Return an address to the pool.
    pub fn release(&self, ip: Ipv4Addr) {
        let mut pool = self.pool.lock();
        if pool.leased.remove(&ip) {
            pool.candidates.push_back(ip);
            tracing::debug!(ip = %ip, "released address");
        }
    }

    /// Addresses currently leased, sorted.
    pub fn leased(&self) -> Vec<Ipv4Addr> {
        let mut leased: Vec<_> = self.pool.lock().leased.iter().copied().collect();
        leased.sort();
        leased
    }

    fn scan_nmap(&self, subnet: Subnet) -> Result<Vec<Ipv4Addr>> {
        let cidr = subnet.to_string();
        let output = self
            .runner
            .run("nmap", &["-v", "-sn", "-n", &cidr, "-oG", "-"])
            .map_err(|e| {
                Error::network(
                    "scan subnet",
                    format!("{} (set network.scan = \"subnet\" to allocate without nmap)", e),
                )
            })?;
        Ok(parse_nmap_down_hosts(&output))
    }
}

/// Pop cached candidates until one can be leased.
fn take_usable(pool: &mut PoolState, bridge_ip: Ipv4Addr, subnet: Subnet) -> Option<Ipv4Addr> {
    while let Some(ip) = pool.candidates.pop_front() {
        let usable = subnet.contains(ip)
            && ip != bridge_ip
            && ip != subnet.network()
            && ip != subnet.broadcast()
            && !pool.leased.contains(&ip);
        if usable {
            pool.leased.insert(ip);
            return Some(ip);
        }
    }
    None
}

/// Lease the next free address after the walk cursor.
///
/// The walk starts past the leading reserved addresses and moves forward
/// only; addresses released behind it come back through the cache.
fn walk_subnet(pool: &mut PoolState, bridge_ip: Ipv4Addr, subnet: Subnet) -> Option<Ipv4Addr> {
    let first = u32::from(subnet.network()).saturating_add(RESERVED_LEADING_ADDRESSES as u32);
    let broadcast = u32::from(subnet.broadcast());
    let start = pool.cursor.unwrap_or(first);

    for raw in start..broadcast {
        let ip = Ipv4Addr::from(raw);
        if ip != bridge_ip && !pool.leased.contains(&ip) {
            pool.cursor = Some(raw + 1);
            pool.leased.insert(ip);
            return Some(ip);
        }
    }
    pool.cursor = Some(broadcast);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;

    const NMAP_OUTPUT: &str = "\
# Nmap 7.94 scan initiated as: nmap -v -sn -n 10.0.0.0/29 -oG -
Host: 10.0.0.0 ()\tStatus: Down
Host: 10.0.0.1 ()\tStatus: Up
Host: 10.0.0.2 ()\tStatus: Down
Host: 10.0.0.3 ()\tStatus: Down
Host: 10.0.0.4 ()\tStatus: Up
Host: 10.0.0.5 ()\tStatus: Down
Host: 10.0.0.6 ()\tStatus: Down
Host: 10.0.0.7 ()\tStatus: Down
# Nmap done at Mon Jan  1 00:00:00 2024 -- 8 IP addresses (2 hosts up) scanned";

    fn bridge() -> (Ipv4Addr, Subnet) {
        Subnet::parse_cidr("10.0.0.1/29").unwrap()
    }

    #[test]
    fn test_subnet_math() {
        let (addr, subnet) = Subnet::parse_cidr("172.16.4.1/22").unwrap();
        assert_eq!(addr, Ipv4Addr::new(172, 16, 4, 1));
        assert_eq!(subnet.network(), Ipv4Addr::new(172, 16, 4, 0));
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 252, 0));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(172, 16, 7, 255));
        assert!(subnet.contains(Ipv4Addr::new(172, 16, 6, 9)));
        assert!(!subnet.contains(Ipv4Addr::new(172, 16, 8, 1)));
        assert_eq!(subnet.to_string(), "172.16.4.0/22");
        assert!(Subnet::parse_cidr("10.0.0.1").is_err());
        assert!(Subnet::parse_cidr("10.0.0.1/33").is_err());
    }

    #[test]
    fn test_parse_nmap_down_hosts() {
        let down = parse_nmap_down_hosts(NMAP_OUTPUT);
        assert_eq!(
            down,
            vec![
                Ipv4Addr::new(10, 0, 0, 0),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 5),
                Ipv4Addr::new(10, 0, 0, 6),
                Ipv4Addr::new(10, 0, 0, 7),
            ]
        );
    }

    #[test]
    fn test_first_two_scanned_addresses_are_skipped() {
        let runner = Arc::new(ScriptedRunner::new().on("nmap", NMAP_OUTPUT));
        let allocator = IpAllocator::new(runner, ScanMode::Nmap);
        let (bridge_ip, subnet) = bridge();

        // .0 and .2 are the first two down hosts; .3 is next
        assert_eq!(
            allocator.allocate(bridge_ip, subnet).unwrap(),
            Ipv4Addr::new(10, 0, 0, 3)
        );
    }

    #[test]
    fn test_cache_consulted_before_rescan() {
        let runner = Arc::new(ScriptedRunner::new().on("nmap", NMAP_OUTPUT));
        let allocator = IpAllocator::new(runner.clone(), ScanMode::Nmap);
        let (bridge_ip, subnet) = bridge();

        let a = allocator.allocate(bridge_ip, subnet).unwrap();
        let b = allocator.allocate(bridge_ip, subnet).unwrap();
        assert_ne!(a, b);
        assert_eq!(runner.calls_matching("nmap").len(), 1);
        assert_eq!(runner.calls()[0], "nmap -v -sn -n 10.0.0.0/29 -oG -");
    }

    #[test]
    fn test_broadcast_and_leased_never_handed_out() {
        let runner = Arc::new(ScriptedRunner::new().on("nmap", NMAP_OUTPUT));
        let allocator = IpAllocator::new(runner, ScanMode::Nmap);
        let (bridge_ip, subnet) = bridge();

        let mut seen = Vec::new();
        while let Ok(ip) = allocator.allocate(bridge_ip, subnet) {
            assert!(!seen.contains(&ip), "address handed out twice: {}", ip);
            seen.push(ip);
        }
        // .3, .5, .6 usable; .7 is the broadcast address
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(&subnet.broadcast()));
        assert_eq!(allocator.leased(), seen);
    }

    #[test]
    fn test_release_returns_address_to_cache() {
        let runner = Arc::new(ScriptedRunner::new().on("nmap", NMAP_OUTPUT));
        let allocator = IpAllocator::new(runner.clone(), ScanMode::Nmap);
        let (bridge_ip, subnet) = bridge();

        let first = allocator.allocate(bridge_ip, subnet).unwrap();
        let _ = allocator.allocate(bridge_ip, subnet).unwrap();
        let _ = allocator.allocate(bridge_ip, subnet).unwrap();
        allocator.release(first);

        assert_eq!(allocator.allocate(bridge_ip, subnet).unwrap(), first);
        assert_eq!(runner.calls_matching("nmap").len(), 1);
    }

    #[test]
    fn test_subnet_mode_excludes_bridge() {
        let runner = Arc::new(ScriptedRunner::new());
        let allocator = IpAllocator::new(runner.clone(), ScanMode::Subnet);
        let (_, subnet) = Subnet::parse_cidr("10.1.0.3/29").unwrap();
        let bridge_ip = Ipv4Addr::new(10, 1, 0, 3);

        let mut seen = Vec::new();
        while let Ok(ip) = allocator.allocate(bridge_ip, subnet) {
            seen.push(ip);
        }
        // .0 .1 skipped as leading, .3 is the bridge, .7 broadcast
        assert_eq!(
            seen,
            vec![
                Ipv4Addr::new(10, 1, 0, 2),
                Ipv4Addr::new(10, 1, 0, 4),
                Ipv4Addr::new(10, 1, 0, 5),
                Ipv4Addr::new(10, 1, 0, 6),
            ]
        );
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_subnet_mode_walks_large_subnet_lazily() {
        let runner = Arc::new(ScriptedRunner::new());
        let allocator = IpAllocator::new(runner.clone(), ScanMode::Subnet);
        let (bridge_ip, subnet) = Subnet::parse_cidr("10.0.0.2/8").unwrap();

        let a = allocator.allocate(bridge_ip, subnet).unwrap();
        let b = allocator.allocate(bridge_ip, subnet).unwrap();
        // .0 and .1 are leading reserved, .2 is the bridge
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(b, Ipv4Addr::new(10, 0, 0, 4));
        assert!(allocator.pool.lock().candidates.is_empty());

        allocator.release(a);
        assert_eq!(allocator.allocate(bridge_ip, subnet).unwrap(), a);
        assert_eq!(
            allocator.allocate(bridge_ip, subnet).unwrap(),
            Ipv4Addr::new(10, 0, 0, 5)
        );
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_missing_nmap_is_network_error_with_hint() {
        let runner = Arc::new(ScriptedRunner::new().fail("nmap", "nmap not found"));
        let allocator = IpAllocator::new(runner, ScanMode::Nmap);
        let (bridge_ip, subnet) = bridge();

        let err = allocator.allocate(bridge_ip, subnet).unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
        assert!(err.to_string().contains("nmap not found"));
        assert!(err.to_string().contains("subnet"));
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let runner = Arc::new(ScriptedRunner::new());
        let allocator = Arc::new(IpAllocator::new(runner, ScanMode::Subnet));
        let (bridge_ip, subnet) = Subnet::parse_cidr("10.2.0.1/24").unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || allocator.allocate(bridge_ip, subnet).unwrap())
            })
            .collect();
        let ips: HashSet<Ipv4Addr> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ips.len(), 16);
        assert!(!ips.contains(&bridge_ip));
    }
}
