//! Log-file setup.
//!
//! Every run appends to a plain-text log next to the manifest. Verbose
//! runs additionally mirror the log to stderr, which keeps stdout clean
//! for the progress line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Returns the log path companion to a manifest file.
pub fn log_path(manifest: &Path) -> PathBuf {
    let mut path = manifest.as_os_str().to_os_string();
    path.push(".download.log");
    PathBuf::from(path)
}

/// Installs the global subscriber: append-only file sink, optional stderr
/// mirror, `RUST_LOG` override respected.
pub fn init(log_file: &Path, verbose: bool) -> anyhow::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("cannot open log file {}", log_file.display()))?;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .with_target(false);

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if verbose {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()
            .context("cannot install log subscriber")?;
    } else {
        registry.try_init().context("cannot install log subscriber")?;
    }
    Ok(())
}
