use std::path::PathBuf;

use clap::Parser;

/// cadenzad — a lightweight continuous-integration scheduler daemon.
#[derive(Debug, Parser)]
#[command(name = "cadenzad", version, about)]
pub struct Cli {
    /// Base configuration directory (holds cadenza.json or cadenza.yaml).
    #[arg(short = 'c', long, default_value = "/etc/cadenza")]
    pub config_dir: PathBuf,

    /// Fork into the background.
    #[arg(short = 'd', long)]
    pub fork: bool,

    /// Verbose logging.
    #[arg(long)]
    pub debug: bool,

    /// Suppress log timestamps.
    #[arg(long)]
    pub no_timestamp: bool,
}
