//! Post-download integrity verification.
//!
//! Re-reads what the pipeline wrote: every completed regular part is hashed
//! over its byte range and compared to the stored digest, and every fully
//! downloaded symlink file is hashed end to end against its whole-file
//! digest. Mismatches reset the corresponding state rows so the next
//! `download` run re-fetches exactly the bad content; a corrupt symlink
//! file is also truncated because its chunks have no individual checksums
//! to narrow the damage.
//!
//! Verification runs on the same worker-pool shape as the downloader.
//! Issues are collected over a channel and reported in bulk at the end.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::checksum::{md5_of_file, md5_of_range};
use crate::state::{local_path, PartKind, RegularPart, StateError, StateStore, SymlinkRecord};

/// A single verification finding. The run continues past these; they are
/// reported together once every part has been checked.
#[derive(Debug, Clone, Error)]
pub enum VerifyIssue {
    /// A downloaded file is gone from disk.
    #[error("file {} does not exist; re-run download to restore it", path.display())]
    MissingFile {
        /// File id whose state was reset.
        file_id: String,
        /// Expected on-disk path.
        path: PathBuf,
    },

    /// One part of a regular file has the wrong content.
    #[error("md5 mismatch for {name} part {part_id}; re-run download to repair it")]
    PartMismatch {
        /// File id.
        file_id: String,
        /// File name.
        name: String,
        /// The mismatching part.
        part_id: i64,
    },

    /// A symlink file's whole-file digest is wrong.
    #[error("md5 mismatch for symlink file {name}; re-run download to repair it")]
    SymlinkMismatch {
        /// File id.
        file_id: String,
        /// File name.
        name: String,
    },
}

/// Errors that abort verification outright.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The state store failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// A file could not be read for a reason other than absence or length.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        /// The unreadable path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a verification pass.
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Everything found wrong, in discovery order.
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    /// True when every checked part and file matched its digest.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Verifies all completed state against the on-disk content.
///
/// # Errors
///
/// Returns [`VerifyError`] for store failures and unreadable files.
/// Checksum mismatches are not errors; they are collected in the report.
pub async fn verify(store: &StateStore, workers: usize) -> Result<VerifyReport, VerifyError> {
    let mut issues = Vec::new();

    let parts = store.completed_regular_parts().await?;
    info!(parts = parts.len(), "verifying regular file parts");
    run_pool(workers, parts, &mut issues, store, |part, store| {
        Box::pin(check_regular_part(part, store))
    })
    .await?;

    let mut complete_symlinks = Vec::new();
    for record in store.symlink_records().await? {
        if store.symlink_complete(&record.file_id).await? {
            complete_symlinks.push(record);
        }
    }
    info!(files = complete_symlinks.len(), "verifying symlink files");
    run_pool(workers, complete_symlinks, &mut issues, store, |record, store| {
        Box::pin(check_symlink(record, store))
    })
    .await?;

    if issues.is_empty() {
        info!("integrity check passed");
    } else {
        warn!(issues = issues.len(), "integrity check found mismatches");
    }
    Ok(VerifyReport { issues })
}

type CheckFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<Option<VerifyIssue>, VerifyError>> + Send>,
>;

/// Fans `items` out over a small worker pool, funneling findings into
/// `issues` and failing fast on the first fatal error.
async fn run_pool<T, F>(
    workers: usize,
    items: Vec<T>,
    issues: &mut Vec<VerifyIssue>,
    store: &StateStore,
    check: F,
) -> Result<(), VerifyError>
where
    T: Send + 'static,
    F: Fn(T, StateStore) -> CheckFuture + Send + Sync + Copy + 'static,
{
    if items.is_empty() {
        return Ok(());
    }
    let capacity = items.len();
    let (job_tx, job_rx) = mpsc::channel::<T>(capacity);
    let (issue_tx, mut issue_rx) = mpsc::channel::<VerifyIssue>(capacity);

    for item in items {
        // Capacity covers every item; this send cannot block.
        let _ = job_tx.send(item).await;
    }
    drop(job_tx);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let mut handles = Vec::with_capacity(workers.max(1));
    for _ in 0..workers.max(1) {
        let jobs = Arc::clone(&job_rx);
        let issue_tx = issue_tx.clone();
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let item = {
                    let mut rx = jobs.lock().await;
                    rx.recv().await
                };
                let Some(item) = item else {
                    return Ok::<(), VerifyError>(());
                };
                if let Some(issue) = check(item, store.clone()).await? {
                    let _ = issue_tx.send(issue).await;
                }
            }
        }));
    }
    drop(issue_tx);

    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => first_error = first_error.or(Some(error)),
            Err(_) => warn!("verification worker panicked"),
        }
    }
    while let Some(issue) = issue_rx.recv().await {
        issues.push(issue);
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

async fn check_regular_part(
    part: RegularPart,
    store: StateStore,
) -> Result<Option<VerifyIssue>, VerifyError> {
    let path = local_path(&part.folder, &part.name);
    match md5_of_range(&path, part.offset as u64, part.size as u64).await {
        Ok(digest) if digest == part.md5 => Ok(None),
        Ok(_) => {
            // Only this part is wrong; sibling parts keep their state.
            store.reset_regular_part(&part.file_id, part.part_id).await?;
            Ok(Some(VerifyIssue::PartMismatch {
                file_id: part.file_id,
                name: part.name,
                part_id: part.part_id,
            }))
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            store.reset_file(&part.file_id, PartKind::Regular).await?;
            Ok(Some(VerifyIssue::MissingFile {
                file_id: part.file_id,
                path,
            }))
        }
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            // The file is shorter than this part's range; the content that
            // should be there is not.
            store.reset_regular_part(&part.file_id, part.part_id).await?;
            Ok(Some(VerifyIssue::PartMismatch {
                file_id: part.file_id,
                name: part.name,
                part_id: part.part_id,
            }))
        }
        Err(source) => Err(VerifyError::Io { path, source }),
    }
}

async fn check_symlink(
    record: SymlinkRecord,
    store: StateStore,
) -> Result<Option<VerifyIssue>, VerifyError> {
    let path = local_path(&record.folder, &record.name);
    match md5_of_file(&path).await {
        Ok(digest) if digest == record.md5 => Ok(None),
        Ok(_) => {
            truncate_file(&path).await?;
            store.reset_file(&record.file_id, PartKind::Symlink).await?;
            Ok(Some(VerifyIssue::SymlinkMismatch {
                file_id: record.file_id,
                name: record.name,
            }))
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            store.reset_file(&record.file_id, PartKind::Symlink).await?;
            Ok(Some(VerifyIssue::MissingFile {
                file_id: record.file_id,
                path,
            }))
        }
        Err(source) => Err(VerifyError::Io { path, source }),
    }
}

async fn truncate_file(path: &std::path::Path) -> Result<(), VerifyError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|source| VerifyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.set_len(0).await.map_err(|source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    })
}
