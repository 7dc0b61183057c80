//! CLI argument parsing

use std::path::PathBuf;

use clap::Parser;

/// NVSentinel - cluster-level GPU fleet reliability system
#[derive(Debug, Parser)]
#[command(name = "nvsentinel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/nvsentinel/config.yaml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "NVSENTINEL_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "NVSENTINEL_LOG_JSON")]
    pub log_json: bool,

    /// Comma-or-space-separated XID codes to additionally ignore
    /// (non-numeric tokens are discarded)
    #[arg(long, env = "NVSENTINEL_IGNORED_XIDS")]
    pub additional_ignored_xids: Option<String>,

    /// Dry run mode - log node/pod actions but don't execute them
    #[arg(long, default_value = "false")]
    pub dry_run: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
