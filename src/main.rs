//! catapult-node CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

/// catapult-node - Firecracker microVM node agent
#[derive(Parser, Debug)]
#[command(name = "catapult-node")]
#[command(about = "Provision and supervise Firecracker microVMs on this host")]
#[command(
    long_about = "catapult-node runs on each host of a cluster. It wires VMs into the host \
bridge, builds root drives from container images, attaches remote volumes and supervises \
one firecracker process per VM.\n\n\
Quick start:\n  \
catapult-node serve --bridge fcbridge\n  \
catapult-node drive create library/alpine:3.19"
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API server
    Serve(cli::serve::ServeCmd),

    /// Build root drives
    #[command(subcommand)]
    Drive(cli::drive::DriveCmd),

    /// Export the OpenAPI document
    Openapi(cli::openapi::OpenapiCmd),
}

fn main() {
    let cli = Cli::parse();

    init_logging();

    tracing::debug!(version = catapult_node::VERSION, "starting catapult-node");

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(),
        Commands::Drive(cmd) => cmd.run(),
        Commands::Openapi(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, code = e.code(), "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("catapult_node=info,tower_http=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
