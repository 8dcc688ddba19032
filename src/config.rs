//! Node configuration.
//!
//! Settings are read from a TOML file, by default
//! `~/.config/catapult-node/node.toml`. A missing default file means built-in
//! defaults; every section and key is optional.
//!
//! ```toml
//! [hypervisor]
//! binary = "/usr/local/bin/firecracker"
//! vm_data_dir = "/var/vms"
//! log_dir = "/var/log/fc-logs"
//! stop_timeout_secs = 10
//!
//! [network]
//! bridge = "fcbridge"
//! tap_prefix = "fc"
//! scan = "nmap"          # or "subnet" when nmap is not installed
//!
//! [storage]
//! scratch_root = "/var/lib/catapult/images"
//! cleanup_scratch = false
//!
//! [logs]
//! max_bytes = 10485760
//! max_files = 3
//!
//! [registries."ghcr.io"]
//! username = "github_user"
//! password_env = "GHCR_TOKEN"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image::auth::RegistryConfig;
use crate::log_rotation::RotationPolicy;
use crate::network::ScanMode;

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Number of VM id characters kept in a tap device name.
pub const TAP_SUFFIX_LEN: usize = 6;

/// Log levels understood by Firecracker's logger.
const FIRECRACKER_LOG_LEVELS: &[&str] = &["Error", "Warning", "Info", "Debug", "Trace", "Off"];

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hypervisor binary, directories and timeouts.
    pub hypervisor: HypervisorSettings,
    /// Bridge, tap naming and address scanning.
    pub network: NetworkSettings,
    /// Image scratch space and volume mapping.
    pub storage: StorageSettings,
    /// Rotation of per-VM log files.
    pub logs: RotationPolicy,
    /// Registry credentials and mirrors for image pulls.
    #[serde(flatten)]
    pub registry: RegistryConfig,
}

/// `[hypervisor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    /// Path to the Firecracker binary.
    pub binary: PathBuf,
    /// Directory holding per-VM API sockets and generated config files.
    pub vm_data_dir: PathBuf,
    /// Directory holding per-VM logs, metrics and their FIFOs.
    pub log_dir: PathBuf,
    /// Firecracker logger level.
    pub log_level: String,
    /// Kernel command line; the network `ip=` argument is appended per VM.
    pub boot_args: String,
    /// A hypervisor that survives this long after spawn is considered started.
    pub startup_grace_ms: u64,
    /// Graceful stop budget before escalating to SIGKILL.
    pub stop_timeout_secs: u64,
    /// Sleep between FIFO reads when no writer is attached.
    pub log_poll_interval_ms: u64,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./firecracker"),
            vm_data_dir: PathBuf::from("/var/vms"),
            log_dir: PathBuf::from("fc-logs"),
            log_level: "Debug".to_string(),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            startup_grace_ms: 3000,
            stop_timeout_secs: crate::process::DEFAULT_STOP_TIMEOUT.as_secs(),
            log_poll_interval_ms: 1000,
        }
    }
}

impl HypervisorSettings {
    /// Startup grace period.
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Graceful stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// FIFO poll interval.
    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }
}

/// `[network]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Bridge every tap device is attached to.
    pub bridge: String,
    /// Prefix of tap device names (`<prefix>-<last 6 of vm id>`).
    pub tap_prefix: String,
    /// How free addresses are discovered.
    pub scan: ScanMode,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bridge: "fcbridge".to_string(),
            tap_prefix: "fc".to_string(),
            scan: ScanMode::Nmap,
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root of per-image scratch directories.
    pub scratch_root: PathBuf,
    /// Tag used for the local OCI layout.
    pub image_tag: String,
    /// Volumes are mounted at `<volume_mount_root>/<volume id>`.
    pub volume_mount_root: PathBuf,
    /// Tool used to map remote volumes (`<tool> map <pool>/volume-<id>`).
    pub volume_map_tool: String,
    /// Remove the scratch directory once a drive has been built.
    pub cleanup_scratch: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("/var/lib/catapult/images"),
            image_tag: "tmp".to_string(),
            volume_mount_root: PathBuf::from("/tmp"),
            volume_map_tool: "rbd-nbd".to_string(),
            cleanup_scratch: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// tried and built-in defaults are used if it is absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(Error::configuration(
                        "load",
                        format!("config file not found: {}", p.display()),
                    ));
                }
                p.to_path_buf()
            }
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => {
                    tracing::debug!("node config file not found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let contents = std::fs::read_to_string(&config_path).map_err(|e| {
            Error::configuration("load", format!("{}: {}", config_path.display(), e))
        })?;
        let config = Self::from_toml(&contents)?;

        tracing::debug!(
            path = %config_path.display(),
            registry_count = config.registry.registries.len(),
            "loaded node configuration"
        );
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| Error::configuration("parse", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("catapult-node").join("node.toml"))
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.network.tap_prefix;
        if prefix.is_empty() || prefix.contains('/') || prefix.contains(char::is_whitespace) {
            return Err(Error::configuration(
                "validate",
                format!("invalid tap prefix: {:?}", prefix),
            ));
        }
        if prefix.len() + 1 + TAP_SUFFIX_LEN > MAX_INTERFACE_NAME_LEN {
            return Err(Error::configuration(
                "validate",
                format!(
                    "tap prefix {:?} too long: device names are limited to {} characters",
                    prefix, MAX_INTERFACE_NAME_LEN
                ),
            ));
        }
        if self.network.bridge.is_empty() || self.network.bridge.len() > MAX_INTERFACE_NAME_LEN {
            return Err(Error::configuration(
                "validate",
                format!("invalid bridge name: {:?}", self.network.bridge),
            ));
        }
        if !FIRECRACKER_LOG_LEVELS.contains(&self.hypervisor.log_level.as_str()) {
            return Err(Error::configuration(
                "validate",
                format!(
                    "unknown log level {:?}, expected one of {}",
                    self.hypervisor.log_level,
                    FIRECRACKER_LOG_LEVELS.join(", ")
                ),
            ));
        }
        if self.hypervisor.stop_timeout_secs == 0 {
            return Err(Error::configuration(
                "validate",
                "stop_timeout_secs must be greater than zero",
            ));
        }
        if self.logs.max_files == 0 {
            return Err(Error::configuration(
                "validate",
                "logs.max_files must be at least 1",
            ));
        }
        if self.storage.image_tag.is_empty() {
            return Err(Error::configuration("validate", "storage.image_tag is empty"));
        }
        Ok(())
    }
}
