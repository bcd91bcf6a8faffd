//! CLI entry point for the bulk download agent.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::error;

use bulkdl_core::{store_path, Endpoint, Options, Session, StateStore};

mod cli;
mod logging;

use cli::{Cli, Command, DownloadArgs, ManifestArg};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            // The subscriber may not be installed yet; print either way.
            error!(error = %format!("{err:#}"), "fatal error");
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Version => {
            println!("bulkdl {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Command::Download(args) => download(args, cli.verbose).await,
        Command::Inspect(args) => inspect(args, cli.verbose).await,
        Command::Progress(args) => progress(args).await,
    }
}

async fn download(args: DownloadArgs, verbose: bool) -> anyhow::Result<ExitCode> {
    logging::init(&logging::log_path(&args.manifest), verbose)?;
    let endpoint = Endpoint::from_env()?;
    let options = Options {
        num_threads: args.num_threads,
        verbose,
    };

    let session = Session::open(endpoint, &args.manifest, options)
        .await
        .context("cannot open download session")?;
    let outcome = session.download().await?;
    session.close().await;

    if outcome.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{} parts failed to download:", outcome.failures.len());
        for failure in &outcome.failures {
            eprintln!(
                "  {} part {}: {}",
                failure.file_id, failure.part_id, failure.error
            );
        }
        eprintln!("Re-run the download subcommand to retry the failed parts.");
        Ok(ExitCode::from(1))
    }
}

async fn inspect(args: DownloadArgs, verbose: bool) -> anyhow::Result<ExitCode> {
    logging::init(&logging::log_path(&args.manifest), verbose)?;
    let endpoint = Endpoint::from_env()?;
    let options = Options {
        num_threads: args.num_threads,
        verbose,
    };

    let session = Session::attach(endpoint, &args.manifest, options).await?;
    let report = session.inspect().await?;
    session.close().await;

    if report.is_clean() {
        println!("Integrity check passed.");
        Ok(ExitCode::SUCCESS)
    } else {
        for issue in &report.issues {
            eprintln!("{issue}");
        }
        eprintln!("Integrity check failed; re-run the download subcommand to repair.");
        Ok(ExitCode::from(1))
    }
}

/// Progress is read-only and needs no credentials, so it opens the store
/// directly instead of going through a session.
async fn progress(args: ManifestArg) -> anyhow::Result<ExitCode> {
    let db_path = store_path(&args.manifest);
    if !db_path.exists() {
        bail!(
            "no download state found for {}; run the download subcommand first",
            args.manifest.display()
        );
    }
    let store = StateStore::open(&db_path).await?;
    let line = bulkdl_core::pipeline::render_line(&store, Duration::from_secs(60)).await?;
    println!("{line}");
    store.close().await;
    Ok(ExitCode::SUCCESS)
}
