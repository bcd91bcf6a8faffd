//! Download planning: state rows, placeholder files, and sizing.
//!
//! Planning happens once per manifest, before the first byte is fetched.
//! Regular files keep the parts the server gave them; symlink files are cut
//! into fixed-size chunks so their download parallelizes like everything
//! else. Every file also gets an empty placeholder on disk so workers can
//! open and write at offsets without coordinating directory creation.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::manifest::DescribedFile;
use crate::state::{
    local_path, RegularPart, StateError, StateStore, SymlinkPart, SymlinkRecord,
};
use crate::units::{GIB, MIB};

/// Chunk size on an interactive host.
///
/// Large enough to keep the TLS/TCP stack busy, small enough that one
/// ranged request usually succeeds without a retry.
pub const INTERACTIVE_CHUNK_SIZE: u64 = 16 * MIB;

/// Chunk size inside a platform job, where bandwidth is higher.
pub const JOB_CHUNK_SIZE: u64 = 64 * MIB;

/// Ceiling for the automatic worker count.
pub const MAX_AUTO_WORKERS: usize = 32;

/// Floor for the worker count.
const MIN_WORKERS: usize = 2;

/// RAM kept free when sizing the worker pool.
const RAM_HEADROOM: u64 = GIB;

/// Projected buffers per worker (scratch buffer plus in-flight copies).
const BUFFERS_PER_WORKER: u64 = 3;

/// Errors raised during planning.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A placeholder file or folder could not be created.
    #[error("cannot prepare {}: {source}", path.display())]
    Io {
        /// The path being prepared.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The state store rejected the planned rows.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Returns the maximum chunk size for the current execution context.
#[must_use]
pub fn chunk_size(inside_job: bool) -> u64 {
    if inside_job {
        JOB_CHUNK_SIZE
    } else {
        INTERACTIVE_CHUNK_SIZE
    }
}

/// Computes the worker count from host resources.
///
/// Starts at `min(2 x cores, 32)` and backs off pairwise until the
/// projected buffer memory leaves at least 1 GiB of RAM free, with a floor
/// of two workers.
#[must_use]
pub fn auto_worker_count(chunk_size: u64, cores: usize, available_ram: u64) -> usize {
    let mut workers = (2 * cores).min(MAX_AUTO_WORKERS);
    while workers > MIN_WORKERS
        && BUFFERS_PER_WORKER * chunk_size * workers as u64 + RAM_HEADROOM > available_ram
    {
        workers -= 2;
    }
    workers.max(MIN_WORKERS)
}

/// Resolves the user's `--num-threads` request; 0 means size from the host.
#[must_use]
pub fn effective_worker_count(requested: usize, chunk_size: u64) -> usize {
    if requested > 0 {
        return requested;
    }
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let workers = auto_worker_count(chunk_size, num_cpus::get(), system.available_memory());
    debug!(
        workers,
        cores = num_cpus::get(),
        chunk_size,
        "sized worker pool from host resources"
    );
    workers
}

/// The state rows for one manifest.
#[derive(Debug, Default)]
pub struct PlannedRows {
    /// Rows for `regular_parts`.
    pub regular: Vec<RegularPart>,
    /// Rows for `symlink_parts`.
    pub symlink_parts: Vec<SymlinkPart>,
    /// Rows for `symlinks`.
    pub symlinks: Vec<SymlinkRecord>,
}

/// Lays out state rows for the described files.
///
/// Regular parts keep their server-assigned ids with offsets accumulated
/// in part order. Symlink files are split into `chunk_size` chunks; only
/// the last chunk may be smaller.
#[must_use]
pub fn plan_rows(files: &[DescribedFile], chunk_size: u64) -> PlannedRows {
    let mut rows = PlannedRows::default();

    for file in files {
        match file {
            DescribedFile::Regular(f) => {
                let mut offset = 0i64;
                for part in &f.parts {
                    rows.regular.push(RegularPart {
                        file_id: f.id.clone(),
                        project: f.project.clone(),
                        name: f.name.clone(),
                        folder: f.folder.clone(),
                        part_id: i64::from(part.id),
                        offset,
                        size: part.size as i64,
                        md5: part.md5.clone(),
                        bytes_fetched: 0,
                        done_time_ns: 0,
                    });
                    offset += part.size as i64;
                }
            }
            DescribedFile::Symlink(f) => {
                let mut offset = 0u64;
                let mut part_id = 1i64;
                while offset < f.size {
                    let len = chunk_size.min(f.size - offset);
                    rows.symlink_parts.push(SymlinkPart {
                        file_id: f.id.clone(),
                        project: f.project.clone(),
                        name: f.name.clone(),
                        folder: f.folder.clone(),
                        part_id,
                        offset: offset as i64,
                        size: len as i64,
                        bytes_fetched: 0,
                        done_time_ns: 0,
                    });
                    offset += len;
                    part_id += 1;
                }
                rows.symlinks.push(SymlinkRecord {
                    file_id: f.id.clone(),
                    folder: f.folder.clone(),
                    project: f.project.clone(),
                    name: f.name.clone(),
                    size: f.size as i64,
                    url: f.url.clone(),
                    md5: f.md5.clone(),
                });
            }
        }
    }
    rows
}

/// Creates the schema, inserts all planned rows, and materializes
/// placeholder files.
///
/// # Errors
///
/// Returns [`PlanError`] when the schema or rows cannot be written, or a
/// placeholder cannot be created.
pub async fn initialize_store(
    store: &StateStore,
    files: &[DescribedFile],
    chunk_size: u64,
) -> Result<(), PlanError> {
    store.create_schema().await?;
    let rows = plan_rows(files, chunk_size);
    info!(
        regular_parts = rows.regular.len(),
        symlink_parts = rows.symlink_parts.len(),
        symlinks = rows.symlinks.len(),
        "recording manifest state"
    );
    store
        .insert_rows(&rows.regular, &rows.symlink_parts, &rows.symlinks)
        .await?;
    prepare_files(files)?;
    Ok(())
}

/// Creates an empty file for every download target that does not exist
/// yet, materializing missing folders with permissive mode.
///
/// # Errors
///
/// Returns [`PlanError::Io`] when a folder or file cannot be created.
pub fn prepare_files(files: &[DescribedFile]) -> Result<(), PlanError> {
    for file in files {
        let path = local_path(file.folder(), file.name());
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            create_folder(parent).map_err(|source| PlanError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::File::create(&path).map_err(|source| PlanError::Io {
            path: path.clone(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_folder(folder: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o777)
        .create(folder)
}

#[cfg(not(unix))]
fn create_folder(folder: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(folder)
}
