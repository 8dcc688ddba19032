//! Root drive commands.

use clap::Subcommand;
use std::path::PathBuf;
use std::sync::Arc;

use catapult_node::command::SystemRunner;
use catapult_node::config::NodeConfig;
use catapult_node::image::ImageProvisioner;

use super::format_bytes;

/// Build root drives on this host.
#[derive(Subcommand, Debug)]
pub enum DriveCmd {
    /// Pull an image and build an ext4 drive from it
    Create {
        /// Image reference, e.g. library/alpine:3.19
        image: String,

        /// Node config file (defaults to the user config directory).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Remove the pulled layout and unpacked tree afterwards.
        #[arg(long)]
        cleanup: bool,
    },
}

impl DriveCmd {
    pub fn run(self) -> catapult_node::Result<()> {
        match self {
            DriveCmd::Create {
                image,
                config,
                cleanup,
            } => {
                let mut config = NodeConfig::load(config.as_deref())?;
                if cleanup {
                    config.storage.cleanup_scratch = true;
                }

                let provisioner =
                    ImageProvisioner::new(Arc::new(SystemRunner), config.storage, config.registry);
                let artifact = provisioner.pull_and_unpack(&image)?;

                println!("{}", artifact.rootfs_path.display());
                eprintln!(
                    "image {} unpacked: {} of files, {} drive",
                    image,
                    format_bytes(artifact.size_bytes),
                    format_bytes(artifact.disk_bytes)
                );
                Ok(())
            }
        }
    }
}
