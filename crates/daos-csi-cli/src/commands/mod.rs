//! CLI command definitions and dispatch.

pub mod node;
pub mod sidecar;

use clap::{Parser, Subcommand, ValueEnum};

/// DAOS CSI node plugin.
#[derive(Parser, Debug)]
#[command(name = "daos-csi", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the CSI identity and node services.
    Node(node::NodeArgs),
    /// Receive FUSE handles and run the filesystem daemon on them.
    Sidecar(sidecar::SidecarArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Node(args) => node::execute(args),
        Command::Sidecar(args) => sidecar::execute(args),
    }
}
