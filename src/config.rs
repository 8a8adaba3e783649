//! Server configuration: built-in defaults, an optional TOML file, then
//! command-line overrides.

use crate::cli::DaemonOpts;
use crate::protocol::{limits, timeouts};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a body with `Content-Length: 0` is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EmptyBodyPolicy {
    /// Answer 400 and store nothing.
    #[default]
    Reject,
    /// Store an empty object named by the digest of no bytes.
    Store,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub root: PathBuf,
    pub queue_capacity: usize,
    pub chunk_size: usize,
    pub max_header_bytes: usize,
    pub header_timeout: Duration,
    pub bridge_timeout: Duration,
    pub drain_timeout: Duration,
    /// `None` disables the live-resource reporter.
    pub stats_interval: Option<Duration>,
    pub empty_body: EmptyBodyPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5555".to_string(),
            root: PathBuf::from("storage"),
            queue_capacity: limits::QUEUE_CAPACITY,
            chunk_size: limits::CHUNK_SIZE,
            max_header_bytes: limits::MAX_HEADER_BYTES,
            header_timeout: Duration::from_millis(timeouts::HEADER_READ_MS),
            bridge_timeout: Duration::from_millis(timeouts::BRIDGE_CALL_MS),
            drain_timeout: Duration::from_millis(timeouts::DRAIN_MS),
            stats_interval: Some(Duration::from_millis(timeouts::STATS_INTERVAL_MS)),
            empty_body: EmptyBodyPolicy::Reject,
        }
    }
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub bind: Option<String>,
    pub root: Option<PathBuf>,
    pub queue_capacity: Option<usize>,
    pub chunk_size: Option<usize>,
    pub max_header_bytes: Option<usize>,
    pub header_timeout_ms: Option<u64>,
    pub bridge_timeout_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub stats_interval_ms: Option<u64>,
    pub empty_body: Option<EmptyBodyPolicy>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

impl ServerConfig {
    /// Resolve the effective configuration for `opts`.
    pub fn load(opts: &DaemonOpts) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = &opts.config {
            config.apply_file(ConfigFile::read(path)?);
        }
        config.apply_opts(opts);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.bind {
            self.bind = v;
        }
        if let Some(v) = file.root {
            self.root = v;
        }
        if let Some(v) = file.queue_capacity {
            self.queue_capacity = v;
        }
        if let Some(v) = file.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = file.max_header_bytes {
            self.max_header_bytes = v;
        }
        if let Some(v) = file.header_timeout_ms {
            self.header_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.bridge_timeout_ms {
            self.bridge_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.drain_timeout_ms {
            self.drain_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.stats_interval_ms {
            self.stats_interval = interval(v);
        }
        if let Some(v) = file.empty_body {
            self.empty_body = v;
        }
    }

    pub fn apply_opts(&mut self, opts: &DaemonOpts) {
        if let Some(v) = &opts.bind {
            self.bind = v.clone();
        }
        if let Some(v) = &opts.root {
            self.root = v.clone();
        }
        if let Some(v) = opts.queue_capacity {
            self.queue_capacity = v;
        }
        if let Some(v) = opts.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = opts.max_header_bytes {
            self.max_header_bytes = v;
        }
        if let Some(v) = opts.header_timeout_ms {
            self.header_timeout = Duration::from_millis(v);
        }
        if let Some(v) = opts.bridge_timeout_ms {
            self.bridge_timeout = Duration::from_millis(v);
        }
        if let Some(v) = opts.drain_timeout_ms {
            self.drain_timeout = Duration::from_millis(v);
        }
        if let Some(v) = opts.stats_interval_ms {
            self.stats_interval = interval(v);
        }
        if let Some(v) = opts.empty_body {
            self.empty_body = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1 byte");
        }
        if self.max_header_bytes == 0 {
            bail!("max_header_bytes must be at least 1 byte");
        }
        for (name, value) in [
            ("header_timeout_ms", self.header_timeout),
            ("bridge_timeout_ms", self.bridge_timeout),
            ("drain_timeout_ms", self.drain_timeout),
        ] {
            if value.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }
}

fn interval(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
