//! `daos-csi node`: Serve the CSI identity and node services.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use daos_csi_common::config::DriverConfig;
use daos_csi_common::constants::DEFAULT_ENDPOINT;
use daos_csi_core::fdpass::ScmRights;
use daos_csi_core::mount::KernelMounter;
use daos_csi_driver::driver::DaosDriver;
use daos_csi_driver::endpoint::Endpoint;
use daos_csi_driver::server;

/// Arguments for the `node` command.
#[derive(Args, Debug)]
pub struct NodeArgs {
    /// CSI endpoint (`unix:/path` or `tcp://host:port`).
    #[arg(long, env = "CSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Identity of this node.
    #[arg(long, env = "NODE_ID", default_value = "")]
    pub nodeid: String,

    /// Serve the node service in addition to identity.
    #[arg(long)]
    pub node: bool,

    /// JSON configuration file; flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Uid the filesystem daemon runs as.
    #[arg(long)]
    pub daemon_uid: Option<u32>,

    /// Gid the filesystem daemon runs as.
    #[arg(long)]
    pub daemon_gid: Option<u32>,

    /// Seconds a rendezvous socket waits for the sidecar.
    #[arg(long, value_name = "SECONDS")]
    pub handoff_timeout: Option<u64>,

    /// Seconds a forced unmount may take.
    #[arg(long, value_name = "SECONDS")]
    pub unmount_timeout: Option<u64>,
}

/// Executes the `node` command.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the endpoint cannot
/// be bound, or the server fails.
pub fn execute(args: NodeArgs) -> anyhow::Result<()> {
    let config = driver_config(&args)?;
    let endpoint = Endpoint::parse(&args.endpoint, true)?;
    let driver = Arc::new(DaosDriver::new(
        config,
        Arc::new(KernelMounter::new()),
        Arc::new(ScmRights),
    )?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(server::serve(&endpoint, driver, args.node, shutdown_signal()))?;
    Ok(())
}

/// Merges the optional config file with the command-line overrides.
fn driver_config(args: &NodeArgs) -> anyhow::Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if !args.nodeid.is_empty() {
        config.node_id.clone_from(&args.nodeid);
    }
    if let Some(uid) = args.daemon_uid {
        config.daemon_uid = uid;
    }
    if let Some(gid) = args.daemon_gid {
        config.daemon_gid = gid;
    }
    if let Some(secs) = args.handoff_timeout {
        config.handoff_deadline_ms = secs.saturating_mul(1000);
    }
    if let Some(secs) = args.unmount_timeout {
        config.unmount_timeout_ms = secs.saturating_mul(1000);
    }
    if args.node && config.node_id.is_empty() {
        anyhow::bail!("NodeID cannot be empty for node service");
    }
    Ok(config)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received interrupt, shutting down"),
        Err(e) => tracing::warn!(error = %e, "failed to listen for interrupt"),
    }
}
