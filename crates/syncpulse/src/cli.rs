use std::path::PathBuf;

use clap::Parser;

use syncpulse_config::Mode;

/// Write-propagation latency harness for a multi-tenant realtime store.
///
/// Connects a fleet of subscriber clients over one or two streaming
/// transports, periodically mutates one field through a privileged
/// session, and reports per-client delivery and latency.
#[derive(Debug, Parser)]
#[command(name = "syncpulse", version, about)]
pub struct Cli {
    /// Path to the JSON configuration document.
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Override the configured transport mode (duplex, stream, both).
    #[arg(long, value_name = "MODE")]
    pub mode: Option<Mode>,

    /// Override the seconds between test ticks.
    #[arg(long, value_name = "SECONDS")]
    pub test_interval: Option<u64>,

    /// Override the milliseconds between delivery checks.
    #[arg(long, value_name = "MILLIS")]
    pub check_interval: Option<u64>,

    /// Override the number of delivery checks per worker per tick.
    #[arg(long, value_name = "COUNT")]
    pub check_times: Option<u32>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
