//! Part rows and the job-facing part type.
//!
//! The pipeline downloads two kinds of parts. Regular parts carry their own
//! MD5 and are fetched through preauthorized URLs; symlink parts are plain
//! chunks of an externally hosted file and are only checked through the
//! whole-file checksum. Both kinds share the location fields, so the worker
//! pool treats them as one tagged type and matches where behavior diverges.

use std::path::PathBuf;

/// A row of `regular_parts`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegularPart {
    /// File id.
    pub file_id: String,
    /// Owning project, needed for the preauth call.
    pub project: String,
    /// File name.
    pub name: String,
    /// Target folder.
    pub folder: String,
    /// 1-based part id.
    pub part_id: i64,
    /// Byte offset of this part within the file.
    pub offset: i64,
    /// Part size in bytes.
    pub size: i64,
    /// Expected hex MD5 of the part.
    pub md5: String,
    /// Bytes fetched so far; either 0 or `size`.
    pub bytes_fetched: i64,
    /// Completion timestamp in Unix nanoseconds, 0 while incomplete.
    pub done_time_ns: i64,
}

/// A row of `symlink_parts`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SymlinkPart {
    /// File id.
    pub file_id: String,
    /// Owning project.
    pub project: String,
    /// File name.
    pub name: String,
    /// Target folder.
    pub folder: String,
    /// 1-based chunk id.
    pub part_id: i64,
    /// Byte offset of this chunk within the file.
    pub offset: i64,
    /// Chunk size in bytes.
    pub size: i64,
    /// Bytes fetched so far; either 0 or `size`.
    pub bytes_fetched: i64,
    /// Completion timestamp in Unix nanoseconds, 0 while incomplete.
    pub done_time_ns: i64,
}

/// A row of `symlinks`: one per symlink file, holding what the per-chunk
/// rows cannot, the whole-file checksum and the content URL.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SymlinkRecord {
    /// File id.
    pub file_id: String,
    /// Target folder.
    pub folder: String,
    /// Owning project.
    pub project: String,
    /// File name.
    pub name: String,
    /// Total file size in bytes.
    pub size: i64,
    /// Content URL.
    pub url: String,
    /// Hex MD5 of the whole file.
    pub md5: String,
}

/// Which table a part lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    /// `regular_parts` row.
    Regular,
    /// `symlink_parts` row.
    Symlink,
}

/// A downloadable part of either kind.
#[derive(Debug, Clone)]
pub enum Part {
    /// Part of a regular file.
    Regular(RegularPart),
    /// Chunk of a symlink file, with the content URL from its record.
    Symlink {
        /// The chunk row.
        part: SymlinkPart,
        /// Content URL shared by all chunks of the file.
        url: String,
    },
}

impl Part {
    /// File id.
    #[must_use]
    pub fn file_id(&self) -> &str {
        match self {
            Self::Regular(p) => &p.file_id,
            Self::Symlink { part, .. } => &part.file_id,
        }
    }

    /// 1-based part id.
    #[must_use]
    pub fn part_id(&self) -> i64 {
        match self {
            Self::Regular(p) => p.part_id,
            Self::Symlink { part, .. } => part.part_id,
        }
    }

    /// Byte offset within the file.
    #[must_use]
    pub fn offset(&self) -> u64 {
        match self {
            Self::Regular(p) => p.offset as u64,
            Self::Symlink { part, .. } => part.offset as u64,
        }
    }

    /// Part size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Regular(p) => p.size as u64,
            Self::Symlink { part, .. } => part.size as u64,
        }
    }

    /// Which table the part lives in.
    #[must_use]
    pub fn kind(&self) -> PartKind {
        match self {
            Self::Regular(_) => PartKind::Regular,
            Self::Symlink { .. } => PartKind::Symlink,
        }
    }

    /// On-disk path of the file this part belongs to.
    #[must_use]
    pub fn local_path(&self) -> PathBuf {
        match self {
            Self::Regular(p) => local_path(&p.folder, &p.name),
            Self::Symlink { part, .. } => local_path(&part.folder, &part.name),
        }
    }
}

/// Resolves `./{folder}/{name}` relative to the working directory.
#[must_use]
pub fn local_path(folder: &str, name: &str) -> PathBuf {
    PathBuf::from(format!(".{folder}")).join(name)
}

/// A finished download handed from the worker pool to the store updater.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    /// Which table to update.
    pub kind: PartKind,
    /// File id.
    pub file_id: String,
    /// 1-based part id.
    pub part_id: i64,
    /// Part size; `bytes_fetched` is set to this.
    pub size: i64,
    /// Completion timestamp in Unix nanoseconds.
    pub done_time_ns: i64,
}
