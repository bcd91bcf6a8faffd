//! The concurrent download pipeline.
//!
//! Four stages linked by bounded channels, each sized to the total job
//! count so no stage ever blocks on capacity:
//!
//! 1. the producer scans both part tables for rows with missing bytes and
//!    emits one job per row,
//! 2. the preauth stage attaches a download URL to every job (one API call
//!    per file, cached for the rest of the run),
//! 3. the worker pool performs the ranged fetches and checksum
//!    verification,
//! 4. the store updater marks finished parts complete, ten per
//!    transaction.
//!
//! A watch-stopped reporter task prints progress beside them. Workers never
//! abort the run; per-part failures are collected and the pipeline result
//! is only a success when there are none.

mod preauth;
mod progress;
mod worker;

pub use preauth::PreauthUrl;
pub use progress::render_line;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use crate::api::{ApiClient, RetryPolicy, Transport, TransportError};
use crate::config::Endpoint;
use crate::state::{CompletedPart, Part, RegularPart, StateError, StateStore, SymlinkPart};

/// Completed parts buffered per store transaction.
const UPDATE_BATCH: usize = 10;

/// A unit of work flowing from the preauth stage to the worker pool.
#[derive(Debug)]
pub(crate) enum Job {
    /// Regular part with its preauthorized URL attached.
    Regular {
        /// The part row.
        part: RegularPart,
        /// URL and headers to fetch it with.
        preauth: PreauthUrl,
    },
    /// Symlink chunk with the content URL from its record.
    Symlink {
        /// The chunk row.
        part: SymlinkPart,
        /// Content URL.
        url: String,
    },
}

impl Job {
    fn key(&self) -> (String, i64) {
        match self {
            Self::Regular { part, .. } => (part.file_id.clone(), part.part_id),
            Self::Symlink { part, .. } => (part.file_id.clone(), part.part_id),
        }
    }
}

/// One part that could not be downloaded.
#[derive(Debug, Clone)]
pub struct PartFailure {
    /// File id.
    pub file_id: String,
    /// 1-based part id.
    pub part_id: i64,
    /// What went wrong, for the end-of-run report.
    pub error: String,
}

/// Result of one pipeline run.
#[derive(Debug, Default)]
pub struct DownloadOutcome {
    /// Parts the run attempted (rows with missing bytes at start).
    pub parts_attempted: usize,
    /// Parts that failed; empty on success.
    pub failures: Vec<PartFailure>,
}

impl DownloadOutcome {
    /// True when every attempted part completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Tuning for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Scratch buffer and ranged-fetch chunk size.
    pub chunk_size: u64,
    /// Platform-job mode: slower progress cadence, newline rendering.
    pub inside_job: bool,
    /// Retry policy for every transport the pipeline builds.
    pub retry: RetryPolicy,
}

/// Errors that abort the whole pipeline, as opposed to per-part failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The state store failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// A transport could not be constructed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Runs the pipeline over every incomplete part and drains it.
///
/// # Errors
///
/// Returns [`PipelineError`] for store or transport-construction failures.
/// Individual part failures do not error; they are reported in the
/// [`DownloadOutcome`].
pub async fn run(
    store: &StateStore,
    endpoint: &Endpoint,
    config: &PipelineConfig,
) -> Result<DownloadOutcome, PipelineError> {
    let parts = store.incomplete_parts().await?;
    let total = parts.len();
    if total == 0 {
        info!("all parts already downloaded, nothing to do");
        return Ok(DownloadOutcome::default());
    }

    info!(
        parts = total,
        workers = config.workers,
        chunk_size = config.chunk_size,
        "starting download pipeline"
    );

    // Channel capacity covers every job, so stages never block on send and
    // an early exit cannot deadlock upstream stages.
    let (pending_tx, pending_rx) = mpsc::channel::<Part>(total);
    let (ready_tx, ready_rx) = mpsc::channel::<Job>(total);
    let (done_tx, done_rx) = mpsc::channel::<CompletedPart>(total);
    let (failure_tx, mut failure_rx) = mpsc::channel::<PartFailure>(total);

    let (stop_tx, stop_rx) = watch::channel(false);
    let reporter = progress::spawn(store.clone(), config.inside_job, stop_rx);

    let producer = tokio::spawn(async move {
        for part in parts {
            if pending_tx.send(part).await.is_err() {
                return;
            }
        }
    });

    let api = ApiClient::with_transport(
        endpoint,
        Transport::with_policy(endpoint, config.retry.clone())?,
    );
    let preauth_task = tokio::spawn(preauth::run(
        api,
        pending_rx,
        ready_tx,
        failure_tx.clone(),
    ));

    let ready_rx = Arc::new(Mutex::new(ready_rx));
    let mut workers = Vec::with_capacity(config.workers);
    for id in 0..config.workers {
        let transport = Transport::with_policy(endpoint, config.retry.clone())?;
        let worker = worker::Worker::new(id, transport, config.chunk_size);
        workers.push(tokio::spawn(worker.run(
            Arc::clone(&ready_rx),
            done_tx.clone(),
            failure_tx.clone(),
        )));
    }
    drop(done_tx);
    drop(failure_tx);

    let updater = {
        let store = store.clone();
        tokio::spawn(run_updater(store, done_rx))
    };

    if producer.await.is_err() {
        warn!("job producer panicked");
    }
    if preauth_task.await.is_err() {
        warn!("preauth stage panicked");
    }
    for handle in workers {
        if handle.await.is_err() {
            warn!("download worker panicked");
        }
    }
    let updater_result = updater.await;

    let _ = stop_tx.send(true);
    let _ = reporter.await;

    match updater_result {
        Ok(result) => result?,
        Err(_) => warn!("store updater panicked"),
    }

    let mut failures = Vec::new();
    while let Some(failure) = failure_rx.recv().await {
        failures.push(failure);
    }

    if failures.is_empty() {
        info!(parts = total, "download pipeline drained cleanly");
    } else {
        warn!(failed = failures.len(), "download pipeline finished with failed parts");
    }

    Ok(DownloadOutcome {
        parts_attempted: total,
        failures,
    })
}

/// Stage 4: buffers completions and commits them in batches.
async fn run_updater(
    store: StateStore,
    mut done: mpsc::Receiver<CompletedPart>,
) -> Result<(), StateError> {
    let mut batch: Vec<CompletedPart> = Vec::with_capacity(UPDATE_BATCH);
    while let Some(part) = done.recv().await {
        batch.push(part);
        if batch.len() >= UPDATE_BATCH {
            store.mark_complete(&batch).await?;
            batch.clear();
        }
    }
    // Channel closed: flush whatever is left.
    store.mark_complete(&batch).await?;
    Ok(())
}
