//! catapult-node - node-local control plane for Firecracker microVMs
//!
//! One instance runs on each host. It turns requests from a cluster
//! scheduler into host-level actions and supervises the resulting
//! hypervisor processes.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │  HTTP API (axum)                               api │
//! ├────────────────────────────────────────────────────┤
//! │  NodeService + Reaper                         node │
//! ├────────────┬────────────┬────────────┬─────────────┤
//! │ network    │ image      │ volume     │ hypervisor  │
//! │ tap + ip   │ skopeo     │ rbd-nbd    │ firecracker │
//! ├────────────┴────────────┴────────────┴─────────────┤
//! │  CommandRunner (command)       VmRegistry (vm)     │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use catapult_node::config::NodeConfig;
//! use catapult_node::hypervisor::VmIdentity;
//! use catapult_node::node::NodeService;
//!
//! # async fn run() -> catapult_node::Result<()> {
//! let node = Arc::new(NodeService::from_config(NodeConfig::load(None)?));
//!
//! let vm = node
//!     .start_vm(VmIdentity {
//!         id: "vm-1".into(),
//!         kernel_image_path: PathBuf::from("/var/lib/catapult/vmlinux"),
//!         root_drive_path: PathBuf::from("/var/lib/catapult/rootfs.ext4"),
//!         vcpu_count: 2,
//!         memory_mib: 512,
//!     })
//!     .await?;
//! println!("vm-1 is at {}", vm.lease().ip_address);
//!
//! let exit = node.stop_vm("vm-1", false).await?;
//! println!("vm-1 exited: {}", exit);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod command;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod log_rotation;
pub mod network;
pub mod node;
pub mod process;
pub mod vm;
pub mod volume;

// Re-export main types for convenience
pub use api::ApiDoc;
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use node::NodeService;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
