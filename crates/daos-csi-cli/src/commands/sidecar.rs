//! `daos-csi sidecar`: Serve every staged volume with the filesystem daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use daos_csi_common::constants::DAEMON_BINARY;
use daos_csi_core::fdpass::ScmRights;
use daos_csi_sidecar::supervisor::{SidecarConfig, Supervisor};

/// Arguments for the `sidecar` command.
#[derive(Args, Debug)]
pub struct SidecarArgs {
    /// Directory holding one staging directory per volume.
    #[arg(long, env = "VOLUME_BASE", default_value = "/daos-tmp/.volumes")]
    pub volume_base: PathBuf,

    /// Filesystem daemon binary, resolved on `PATH` when bare.
    #[arg(long, default_value = DAEMON_BINARY)]
    pub daemon_path: PathBuf,
}

/// Executes the `sidecar` command.
///
/// # Errors
///
/// Returns an error if the daemon cannot be found, the volume base cannot
/// be read, or any volume failed.
pub fn execute(args: SidecarArgs) -> anyhow::Result<()> {
    let config = SidecarConfig {
        volume_base: args.volume_base,
        daemon_path: args.daemon_path,
        ..SidecarConfig::default()
    };
    let supervisor = Supervisor::new(config, Arc::new(ScmRights))?;
    let report = supervisor.run()?;
    if report.is_clean() {
        tracing::info!(launched = report.launched, "all daemons exited");
        return Ok(());
    }
    let failed: Vec<String> = report
        .failures
        .iter()
        .map(|(volume, description)| format!("{volume}: {description}"))
        .collect();
    anyhow::bail!("{} volume(s) failed: {}", failed.len(), failed.join("; "))
}
