//! Manifest ingestion.
//!
//! A manifest is a bzip2-compressed JSON document mapping project ids to
//! file entries. Ingestion validates identifiers and folders, fills in
//! missing per-file details through the bulk describe call, and yields a
//! flat list of described files ready for part planning.
//!
//! When every entry already carries a parts table the manifest is trusted
//! and the describe round-trip is skipped entirely.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::api::ApiClient;
use crate::describe::{self, DescribeError, PartDescriptor};

/// Prefixes a container identifier may carry.
const PROJECT_ID_PREFIXES: [&str; 2] = ["project-", "container-"];

/// Prefix every file identifier carries.
const FILE_ID_PREFIX: &str = "file-";

/// Errors raised during manifest ingestion. All of them are fatal; nothing
/// is written unless the whole manifest validates.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file cannot be read.
    #[error("cannot read manifest {}: {source}", path.display())]
    Io {
        /// Manifest path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid bzip2 data.
    #[error("cannot decompress manifest (expected bzip2-compressed JSON): {0}")]
    Decompress(std::io::Error),

    /// The decompressed payload is not the expected JSON shape.
    #[error("cannot parse manifest JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A project key has the wrong prefix.
    #[error("project has invalid id {id:?}")]
    InvalidProjectId {
        /// The offending id.
        id: String,
    },

    /// A file id has the wrong prefix.
    #[error("file has invalid id {id:?}")]
    InvalidFileId {
        /// The offending id.
        id: String,
    },

    /// A folder is empty or not absolute.
    #[error("invalid folder {folder:?}: {reason}")]
    InvalidFolder {
        /// The offending folder.
        folder: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A checksum type other than md5 was requested.
    #[error("file {id} requests unsupported checksum type {kind:?}")]
    UnsupportedChecksumType {
        /// File id.
        id: String,
        /// Requested checksum type.
        kind: String,
    },

    /// A parts table key does not parse as a part number.
    #[error("file {id} has non-numeric part id {key:?}")]
    BadPartId {
        /// File id.
        id: String,
        /// The offending key.
        key: String,
    },

    /// The describe step failed.
    #[error(transparent)]
    Describe(#[from] DescribeError),

    /// A manifest entry was missing from the describe reply.
    #[error("file {id} was not described")]
    NotDescribed {
        /// File id.
        id: String,
    },
}

/// Raw manifest entry as written by the manifest author.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFile {
    /// Target folder, absolute.
    pub folder: String,
    /// File id.
    pub id: String,
    /// File name.
    pub name: String,
    /// Requested checksum algorithm; only md5 is supported.
    #[serde(rename = "checksumType", default)]
    pub checksum_type: Option<String>,
    /// Parts table when the author already knows it.
    #[serde(default)]
    pub parts: Option<HashMap<String, PartDescriptor>>,
}

/// Raw manifest: project id to file entries. A `BTreeMap` keeps ingestion
/// order deterministic across runs.
pub type RawManifest = BTreeMap<String, Vec<RawFile>>;

/// One part of a regular file with its numeric id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// 1-based part id.
    pub id: u32,
    /// Part size in bytes.
    pub size: u64,
    /// Hex MD5 of the part.
    pub md5: String,
    /// Additional checksum, carried but not verified.
    pub checksum: Option<String>,
}

/// A regular file: per-part checksums, fetched via preauthorized URLs.
#[derive(Debug, Clone)]
pub struct RegularFile {
    /// File id.
    pub id: String,
    /// Owning project.
    pub project: String,
    /// Normalized target folder.
    pub folder: String,
    /// File name.
    pub name: String,
    /// Total size, the sum of part sizes.
    pub size: u64,
    /// Parts in ascending id order.
    pub parts: Vec<FilePart>,
}

/// A symlink file: content behind a server-issued URL, one whole-file MD5.
#[derive(Debug, Clone)]
pub struct SymlinkFile {
    /// File id.
    pub id: String,
    /// Owning project.
    pub project: String,
    /// Normalized target folder.
    pub folder: String,
    /// File name.
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    /// Hex MD5 of the whole file.
    pub md5: String,
    /// Content URL.
    pub url: String,
}

/// A manifest entry after ingestion.
#[derive(Debug, Clone)]
pub enum DescribedFile {
    /// Regular platform file.
    Regular(RegularFile),
    /// Symlink file.
    Symlink(SymlinkFile),
}

impl DescribedFile {
    /// File id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Regular(f) => &f.id,
            Self::Symlink(f) => &f.id,
        }
    }

    /// Normalized target folder.
    #[must_use]
    pub fn folder(&self) -> &str {
        match self {
            Self::Regular(f) => &f.folder,
            Self::Symlink(f) => &f.folder,
        }
    }

    /// File name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Regular(f) => &f.name,
            Self::Symlink(f) => &f.name,
        }
    }

    /// Total size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Regular(f) => f.size,
            Self::Symlink(f) => f.size,
        }
    }
}

/// Reads and ingests a manifest file.
///
/// The describe client is only contacted when at least one entry lacks a
/// parts table.
///
/// # Errors
///
/// Returns [`ManifestError`] on I/O, decompression, parse, or validation
/// failure, and for files the platform reports as not downloadable.
pub async fn read_manifest(
    path: &Path,
    client: &ApiClient,
) -> Result<Vec<DescribedFile>, ManifestError> {
    let compressed = tokio::fs::read(path).await.map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut decoder = BzDecoder::new(compressed.as_slice());
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(ManifestError::Decompress)?;

    let raw: RawManifest = serde_json::from_slice(&data)?;
    validate(&raw)?;

    if only_regular_files_with_parts(&raw) {
        info!("all manifest entries carry parts, skipping the describe step");
        return trusted_manifest(&raw);
    }
    validated_manifest(&raw, client).await
}

fn validate(raw: &RawManifest) -> Result<(), ManifestError> {
    for (project_id, files) in raw {
        if !PROJECT_ID_PREFIXES.iter().any(|p| project_id.starts_with(p)) {
            return Err(ManifestError::InvalidProjectId {
                id: project_id.clone(),
            });
        }
        for file in files {
            if !file.id.starts_with(FILE_ID_PREFIX) {
                return Err(ManifestError::InvalidFileId {
                    id: file.id.clone(),
                });
            }
            validate_folder(&file.folder)?;
            if let Some(kind) = &file.checksum_type {
                if !kind.eq_ignore_ascii_case("md5") {
                    return Err(ManifestError::UnsupportedChecksumType {
                        id: file.id.clone(),
                        kind: kind.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn validate_folder(folder: &str) -> Result<(), ManifestError> {
    if folder.is_empty() {
        return Err(ManifestError::InvalidFolder {
            folder: folder.to_string(),
            reason: "the folder cannot be empty",
        });
    }
    if !folder.starts_with('/') {
        return Err(ManifestError::InvalidFolder {
            folder: folder.to_string(),
            reason: "the folder must start with a slash",
        });
    }
    Ok(())
}

/// Collapses duplicate separators and strips the trailing one, so
/// `"//a///b/"` becomes `"/a/b"`. The root folder stays `"/"`.
#[must_use]
pub fn normalize_folder(folder: &str) -> String {
    let mut normalized = String::with_capacity(folder.len());
    let mut last_was_separator = false;
    for c in folder.chars() {
        if c == '/' {
            if !last_was_separator {
                normalized.push('/');
            }
            last_was_separator = true;
        } else {
            normalized.push(c);
            last_was_separator = false;
        }
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn only_regular_files_with_parts(raw: &RawManifest) -> bool {
    raw.values()
        .flatten()
        .all(|file| file.parts.is_some())
}

/// Sorts a parts table by numeric part id. Lexicographic order would put
/// part "10" before part "9" and corrupt every offset after it.
fn sort_parts(
    file_id: &str,
    parts: &HashMap<String, PartDescriptor>,
) -> Result<Vec<FilePart>, ManifestError> {
    let mut sorted = Vec::with_capacity(parts.len());
    for (key, part) in parts {
        let id = key.parse::<u32>().map_err(|_| ManifestError::BadPartId {
            id: file_id.to_string(),
            key: key.clone(),
        })?;
        sorted.push(FilePart {
            id,
            size: part.size,
            md5: part.md5.clone(),
            checksum: part.checksum.clone(),
        });
    }
    sorted.sort_by_key(|part| part.id);
    Ok(sorted)
}

fn trusted_manifest(raw: &RawManifest) -> Result<Vec<DescribedFile>, ManifestError> {
    let mut files = Vec::new();
    for (project_id, entries) in raw {
        for entry in entries {
            let parts = entry
                .parts
                .as_ref()
                .map(|p| sort_parts(&entry.id, p))
                .transpose()?
                .unwrap_or_default();
            let size: u64 = parts.iter().map(|p| p.size).sum();

            files.push(DescribedFile::Regular(RegularFile {
                id: entry.id.clone(),
                project: project_id.clone(),
                folder: normalize_folder(&entry.folder),
                name: entry.name.clone(),
                size,
                parts,
            }));
        }
    }
    Ok(files)
}

async fn validated_manifest(
    raw: &RawManifest,
    client: &ApiClient,
) -> Result<Vec<DescribedFile>, ManifestError> {
    // One describe pass per project.
    let mut described = HashMap::new();
    for (project_id, entries) in raw {
        let ids: Vec<String> = entries.iter().map(|f| f.id.clone()).collect();
        debug!(project = %project_id, files = ids.len(), "describing project files");
        described.extend(describe::describe_bulk(client, &ids).await?);
    }

    let mut files = Vec::new();
    for (project_id, entries) in raw {
        for entry in entries {
            let description =
                described
                    .get(&entry.id)
                    .ok_or_else(|| ManifestError::NotDescribed {
                        id: entry.id.clone(),
                    })?;
            let folder = normalize_folder(&entry.folder);

            match &description.symlink {
                None => {
                    let parts = sort_parts(&entry.id, &description.parts)?;
                    files.push(DescribedFile::Regular(RegularFile {
                        id: entry.id.clone(),
                        project: project_id.clone(),
                        folder,
                        name: entry.name.clone(),
                        size: description.size,
                        parts,
                    }));
                }
                Some(symlink) => {
                    files.push(DescribedFile::Symlink(SymlinkFile {
                        id: entry.id.clone(),
                        project: project_id.clone(),
                        folder,
                        name: entry.name.clone(),
                        size: description.size,
                        md5: symlink.md5.clone(),
                        url: symlink.url.clone(),
                    }));
                }
            }
        }
    }
    Ok(files)
}
