//! HTTP API server command.

use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use catapult_node::config::NodeConfig;
use catapult_node::node::{NodeService, Reaper};
use catapult_node::Error;

use super::parsers::{parse_duration, parse_interface_name};

/// Start the node API server.
#[derive(Args, Debug)]
pub struct ServeCmd {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:8888")]
    listen: SocketAddr,

    /// Node config file (defaults to the user config directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host bridge the VM tap devices join.
    #[arg(long, value_parser = parse_interface_name)]
    bridge: Option<String>,

    /// Path to the firecracker binary.
    #[arg(long)]
    firecracker: Option<PathBuf>,

    /// How long a graceful stop may take before the hypervisor is killed.
    #[arg(long, value_parser = parse_duration)]
    stop_timeout: Option<Duration>,
}

impl ServeCmd {
    pub fn run(self) -> catapult_node::Result<()> {
        let config = self.node_config()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(serve(self.listen, config))
    }

    fn node_config(&self) -> catapult_node::Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref())?;

        if let Some(bridge) = &self.bridge {
            config.network.bridge = bridge.clone();
        }
        if let Some(binary) = &self.firecracker {
            config.hypervisor.binary = binary.clone();
        }
        if let Some(timeout) = self.stop_timeout {
            config.hypervisor.stop_timeout_secs = timeout.as_secs().max(1);
        }

        config.validate()?;
        Ok(config)
    }
}

async fn serve(listen: SocketAddr, config: NodeConfig) -> catapult_node::Result<()> {
    let node = Arc::new(NodeService::from_config(config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = tokio::spawn(Reaper::new(node.clone(), shutdown_rx).run());

    let app = catapult_node::api::create_router(node.clone());
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| Error::configuration("bind", format!("{}: {}", listen, e)))?;

    tracing::info!(listen = %listen, "api server listening");
    eprintln!("catapult-node listening on http://{}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("api server stopped, shutting down vms");
    let _ = shutdown_tx.send(true);
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "reaper task failed");
    }
    node.shutdown_all().await;

    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
