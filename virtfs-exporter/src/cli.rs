//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Per-VM filesystem utilization exporter for libvirt hypervisors.
///
/// Tunables left unset fall back to the config file, then to built-in defaults.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "virtfs-exporter", version, about)]
pub struct Args {
    /// Port to expose metrics on
    #[arg(short = 'p', long, env = "VIRTFS_PORT")]
    pub port: Option<u16>,

    /// IP address to expose metrics on
    #[arg(short = 'i', long = "ip", env = "VIRTFS_ADDR")]
    pub addr: Option<String>,

    /// Libvirt connection URI
    #[arg(long, env = "VIRTFS_LIBVIRT_URI")]
    pub uri: Option<String>,

    /// Optional TOML configuration file
    #[arg(short = 'c', long, env = "VIRTFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seconds between scheduler ticks
    #[arg(long, env = "VIRTFS_INTERVAL_SECS")]
    pub interval_secs: Option<u64>,

    /// Maximum age of a result before re-inspection
    #[arg(long, env = "VIRTFS_FRESHNESS_SECS")]
    pub freshness_secs: Option<u64>,

    /// Maximum concurrent inspections
    #[arg(long, env = "VIRTFS_WORKERS")]
    pub workers: Option<usize>,

    /// Hard timeout for one inspection
    #[arg(long, env = "VIRTFS_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Backoff after the first durable failure
    #[arg(long, env = "VIRTFS_BACKOFF_BASE_SECS")]
    pub backoff_base_secs: Option<u64>,

    /// Upper bound for the failure backoff
    #[arg(long, env = "VIRTFS_BACKOFF_MAX_SECS")]
    pub backoff_max_secs: Option<u64>,

    /// Retry interval when a disk image is locked
    #[arg(long, env = "VIRTFS_BUSY_RETRY_SECS")]
    pub busy_retry_secs: Option<u64>,

    /// Upper bound of the random delay before the first inspections
    #[arg(long, env = "VIRTFS_STARTUP_JITTER_SECS")]
    pub startup_jitter_secs: Option<u64>,

    /// Run inspections now and then continue periodically
    #[arg(long)]
    pub run_now: bool,

    /// Debug messages
    #[arg(long)]
    pub debug: bool,

    /// Directory for rotated log files
    #[arg(long, env = "VIRTFS_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}
