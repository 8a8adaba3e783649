use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use hashsink::cli::DaemonOpts;
use hashsink::{ServerConfig, ServerContext};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&opts.log_level))
        .with_context(|| format!("Invalid log level: {}", opts.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::load(&opts)?;

    if config.root.exists() && !config.root.is_dir() {
        anyhow::bail!("Error: Storage root is not a directory: {}", config.root.display());
    }
    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("Failed to create storage root: {}", config.root.display()))?;
    let canonical_root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    tracing::info!(
        bind = %config.bind,
        root = %canonical_root.display(),
        queue_capacity = config.queue_capacity,
        chunk_size = config.chunk_size,
        empty_body = ?config.empty_body,
        "starting hashsink daemon"
    );
    if config.bind.starts_with("0.0.0.0") {
        tracing::warn!("binding to 0.0.0.0 exposes the unauthenticated upload port on all interfaces");
    }

    let threads = if opts.threads == 0 {
        num_cpus::get()
    } else {
        opts.threads
    };
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let config = ServerConfig {
        root: canonical_root,
        ..config
    };
    let ctx = Arc::new(ServerContext::new(config).context("Failed to open storage root")?);

    rt.block_on(hashsink::serve(ctx, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    }))
}
