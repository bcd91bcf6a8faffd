//! A download session: one manifest, one state store, explicit lifecycle.
//!
//! The session owns every process-level resource the engine needs (endpoint
//! descriptor, state store handle, options) and threads them through the
//! subsystems, so there is no global mutable state anywhere. Open it at
//! command start, close it when the command is done.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::api::{ApiClient, TransportError};
use crate::config::Endpoint;
use crate::manifest::{read_manifest, ManifestError};
use crate::pipeline::{self, render_line, DownloadOutcome, PipelineConfig, PipelineError};
use crate::plan::{chunk_size, effective_worker_count, initialize_store, PlanError};
use crate::state::{store_path, StateError, StateStore};
use crate::units::format_bytes;
use crate::verify::{verify, VerifyError, VerifyReport};

/// Sampling window for one-shot progress lines.
const PROGRESS_WINDOW: Duration = Duration::from_secs(60);

/// Per-run options from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Worker count; 0 sizes the pool from the host.
    pub num_threads: usize,
    /// Verbose logging requested.
    pub verbose: bool,
}

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Manifest ingestion failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Planning failed.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The state store failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// The pipeline failed as a whole.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A transport could not be constructed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Verification failed outright.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// The working directory cannot hold the remaining download.
    #[error(
        "Not enough disk space, available = {}, required = {}",
        format_bytes(*available),
        format_bytes(*required)
    )]
    InsufficientDiskSpace {
        /// Bytes available on the working directory's filesystem.
        available: u64,
        /// Bytes still to download.
        required: u64,
    },

    /// The filesystem would not report its capacity.
    #[error("cannot determine available disk space: {0}")]
    DiskQuery(std::io::Error),

    /// An operation that needs existing state found none.
    #[error(
        "no download state found for {}; run the download subcommand first",
        manifest.display()
    )]
    MissingState {
        /// The manifest whose companion store is missing.
        manifest: PathBuf,
    },
}

/// An open session over one manifest.
#[derive(Debug)]
pub struct Session {
    endpoint: Endpoint,
    manifest_path: PathBuf,
    store: StateStore,
    options: Options,
}

impl Session {
    /// Opens a session, ingesting the manifest if this is the first run.
    ///
    /// When the companion state store already exists it is resumed as-is
    /// and the manifest file is not re-read; a changed manifest requires
    /// deleting the store. Otherwise the manifest is ingested, the store
    /// is created and populated, and placeholder files are materialized.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on ingestion, planning, or store failure.
    pub async fn open(
        endpoint: Endpoint,
        manifest_path: &Path,
        options: Options,
    ) -> Result<Self, SessionError> {
        let db_path = store_path(manifest_path);
        let store = if db_path.exists() {
            info!(store = %db_path.display(), "resuming from existing state");
            StateStore::open(&db_path).await?
        } else {
            let client = ApiClient::new(&endpoint)?;
            let files = read_manifest(manifest_path, &client).await?;
            info!(files = files.len(), "manifest ingested, preparing files for download");
            let store = StateStore::open(&db_path).await?;
            initialize_store(&store, &files, chunk_size(endpoint.inside_job())).await?;
            store
        };

        Ok(Self {
            endpoint,
            manifest_path: manifest_path.to_path_buf(),
            store,
            options,
        })
    }

    /// Opens a session over existing state only; never ingests.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::MissingState`] when the companion store does
    /// not exist.
    pub async fn attach(
        endpoint: Endpoint,
        manifest_path: &Path,
        options: Options,
    ) -> Result<Self, SessionError> {
        let db_path = store_path(manifest_path);
        if !db_path.exists() {
            return Err(SessionError::MissingState {
                manifest: manifest_path.to_path_buf(),
            });
        }
        Ok(Self {
            endpoint,
            manifest_path: manifest_path.to_path_buf(),
            store: StateStore::open(&db_path).await?,
            options,
        })
    }

    /// The manifest this session serves.
    #[must_use]
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// The underlying state store.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Checks that the working directory can hold the remaining bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InsufficientDiskSpace`] naming both
    /// quantities when the filesystem is too small.
    pub async fn check_disk_space(&self) -> Result<(), SessionError> {
        let required = self.store.remaining_bytes().await?;
        let working_dir = std::env::current_dir().map_err(SessionError::DiskQuery)?;
        let available = fs2::available_space(&working_dir).map_err(SessionError::DiskQuery)?;

        if available < required {
            return Err(SessionError::InsufficientDiskSpace {
                available,
                required,
            });
        }
        info!(
            required = %format_bytes(required),
            available = %format_bytes(available),
            "disk space check passed"
        );
        Ok(())
    }

    /// Downloads every incomplete part.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] for precondition and whole-pipeline
    /// failures. Per-part failures are reported in the outcome instead.
    pub async fn download(&self) -> Result<DownloadOutcome, SessionError> {
        self.check_disk_space().await?;

        let chunk = chunk_size(self.endpoint.inside_job());
        let workers = effective_worker_count(self.options.num_threads, chunk);
        println!("Downloading files using {workers} workers");
        info!(workers, "starting download");

        let config = PipelineConfig {
            workers,
            chunk_size: chunk,
            inside_job: self.endpoint.inside_job(),
            retry: crate::api::RetryPolicy::default(),
        };
        let outcome = pipeline::run(&self.store, &self.endpoint, &config).await?;

        let line = self.progress_line().await?;
        println!("{line}");
        if outcome.is_success() {
            println!("Download completed successfully.");
            println!(
                "To perform additional post-download integrity checks, \
                 please use the inspect subcommand."
            );
        }
        Ok(outcome)
    }

    /// Verifies all downloaded content against the stored checksums.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when verification cannot run at all;
    /// mismatches are reported in the returned report.
    pub async fn inspect(&self) -> Result<VerifyReport, SessionError> {
        let chunk = chunk_size(self.endpoint.inside_job());
        let workers = effective_worker_count(self.options.num_threads, chunk);
        Ok(verify(&self.store, workers).await?)
    }

    /// Renders a one-shot progress line from the current state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the store queries fail.
    pub async fn progress_line(&self) -> Result<String, SessionError> {
        Ok(render_line(&self.store, PROGRESS_WINDOW).await?)
    }

    /// Closes the session, releasing the store.
    pub async fn close(self) {
        self.store.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use crate::testutil::CwdGuard;

    use super::*;

    fn offline_endpoint() -> Endpoint {
        Endpoint {
            token: "t".to_string(),
            host: "localhost".to_string(),
            port: 1,
            protocol: "http".to_string(),
            job_id: None,
            ca_file: None,
            insecure_skip_verify: false,
        }
    }

    fn write_trusted_manifest(dir: &Path) -> PathBuf {
        let path = dir.join("manifest.json.bz2");
        let value = serde_json::json!({
            "project-1": [{
                "folder": "/data",
                "id": "file-0001",
                "name": "small.bin",
                "parts": {"1": {"md5": "900150983cd24fb0d6963f7d28e17f72", "size": 3}}
            }]
        });
        let file = std::fs::File::create(&path).unwrap();
        let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        encoder
            .write_all(serde_json::to_string(&value).unwrap().as_bytes())
            .unwrap();
        encoder.finish().unwrap();
        path
    }

    #[tokio::test]
    async fn open_creates_store_and_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(dir.path());
        let manifest = write_trusted_manifest(dir.path());

        let session = Session::open(offline_endpoint(), &manifest, Options::default())
            .await
            .unwrap();
        assert!(store_path(&manifest).exists());
        assert!(dir.path().join("data/small.bin").exists());
        assert_eq!(session.store().remaining_bytes().await.unwrap(), 3);
        session.close().await;
    }

    #[tokio::test]
    async fn reopen_resumes_without_reading_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(dir.path());
        let manifest = write_trusted_manifest(dir.path());

        let session = Session::open(offline_endpoint(), &manifest, Options::default())
            .await
            .unwrap();
        session.close().await;

        // Remove the manifest; resuming only needs the store.
        std::fs::remove_file(&manifest).unwrap();
        let session = Session::open(offline_endpoint(), &manifest, Options::default())
            .await
            .unwrap();
        assert_eq!(session.store().remaining_bytes().await.unwrap(), 3);
        session.close().await;
    }

    #[tokio::test]
    async fn attach_requires_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(dir.path());
        let manifest = write_trusted_manifest(dir.path());

        let err = Session::attach(offline_endpoint(), &manifest, Options::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MissingState { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn disk_guard_passes_for_small_demand() {
        let dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(dir.path());
        let manifest = write_trusted_manifest(dir.path());

        let session = Session::open(offline_endpoint(), &manifest, Options::default())
            .await
            .unwrap();
        session.check_disk_space().await.unwrap();
        session.close().await;
    }

    #[test]
    fn disk_space_error_is_human_readable() {
        let err = SessionError::InsufficientDiskSpace {
            available: 3 * crate::units::GIB / 2,
            required: 2 * crate::units::GIB,
        };
        let msg = err.to_string();
        assert!(msg.contains("available = 1.5GiB"), "{msg}");
        assert!(msg.contains("required = 2.0GiB"), "{msg}");
    }
}
