//! Command-line options for the upload daemon

use crate::config::EmptyBodyPolicy;
use clap::Parser;
use std::path::PathBuf;

/// Daemon options. Every setting except `--config`, `--log-level` and
/// `--threads` can also come from the TOML file; flags given here win.
#[derive(Clone, Debug, Default, Parser)]
#[command(
    name = "hashsinkd",
    version,
    about = "Streaming content-addressed upload daemon"
)]
pub struct DaemonOpts {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port) [default: 0.0.0.0:5555]
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory that receives stored objects [default: storage]
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Capacity of each per-upload queue [default: 100]
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Body read size in bytes [default: 16384]
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Largest accepted header block in bytes [default: 65536]
    #[arg(long)]
    pub max_header_bytes: Option<usize>,

    /// Deadline for the complete header block [default: 5000]
    #[arg(long)]
    pub header_timeout_ms: Option<u64>,

    /// Deadline for each queue call made by the persistence worker [default: 20000]
    #[arg(long)]
    pub bridge_timeout_ms: Option<u64>,

    /// Deadline for flushing the response [default: 2000]
    #[arg(long)]
    pub drain_timeout_ms: Option<u64>,

    /// Live-resource report interval, 0 disables [default: 10000]
    #[arg(long)]
    pub stats_interval_ms: Option<u64>,

    /// What to do with a zero-length body [default: reject]
    #[arg(long, value_enum)]
    pub empty_body: Option<EmptyBodyPolicy>,

    /// Log filter (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Runtime worker threads (0 = auto)
    #[arg(short = 't', long, default_value_t = 0)]
    pub threads: usize,
}
