//! Bulk object description.
//!
//! The platform can describe up to 1000 objects per call, so lookups are
//! batched. Only the fields the downloader needs are requested; the full
//! describe output is large and a burden on the server side.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::api::{ApiClient, TransportError};

/// Limit on the number of objects a single describe call accepts.
pub const MAX_OBJECTS_PER_DESCRIBE: usize = 1000;

/// Route of the bulk describe call.
const DESCRIBE_ROUTE: &str = "system/describeDataObjects";

/// Errors raised while describing manifest files.
#[derive(Debug, Error)]
pub enum DescribeError {
    /// The API call itself failed.
    #[error(transparent)]
    Api(#[from] TransportError),

    /// The reply was not the expected JSON shape.
    #[error("cannot parse describe reply: {0}")]
    MalformedReply(#[from] serde_json::Error),

    /// A file is still open or in another non-final state.
    #[error("file {id} is not closed, it is {state}")]
    NotClosed {
        /// File id.
        id: String,
        /// Reported state.
        state: String,
    },

    /// A file is archived and cannot be read.
    #[error("file {id} is not live, it cannot be read (state={state})")]
    NotLive {
        /// File id.
        id: String,
        /// Reported archival state.
        state: String,
    },

    /// A symlink description without the whole-file checksum.
    #[error("symlink file {id} has no md5 checksum")]
    MissingChecksum {
        /// File id.
        id: String,
    },

    /// A symlink description without a content URL.
    #[error("symlink file {id} has no content URL")]
    MissingUrl {
        /// File id.
        id: String,
    },
}

/// One part of a regular file as described by the platform.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PartDescriptor {
    /// Hex MD5 of the part content.
    pub md5: String,
    /// Part size in bytes.
    pub size: u64,
    /// Additional checksum, carried but not verified.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Content location and checksum of a symlink file.
#[derive(Debug, Clone)]
pub struct SymlinkDescriptor {
    /// Server-issued URL the content is served from.
    pub url: String,
    /// Hex MD5 of the whole file.
    pub md5: String,
}

/// The subset of a file description the downloader consumes.
#[derive(Debug, Clone)]
pub struct DescribedObject {
    /// File id.
    pub id: String,
    /// Project the file belongs to.
    pub project: String,
    /// File name.
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    /// Parts table, keyed by stringified part id. Empty for symlinks.
    pub parts: HashMap<String, PartDescriptor>,
    /// Present when the file is a symlink.
    pub symlink: Option<SymlinkDescriptor>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    results: Vec<ReplyEntry>,
}

#[derive(Debug, Deserialize)]
struct ReplyEntry {
    describe: RawDescription,
}

#[derive(Debug, Deserialize)]
struct RawSymlinkPath {
    object: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescription {
    id: String,
    project: String,
    name: String,
    state: String,
    archival_state: String,
    size: u64,
    #[serde(default)]
    parts: HashMap<String, PartDescriptor>,
    #[serde(default)]
    symlink_path: Option<RawSymlinkPath>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    drive: Option<String>,
}

/// Describes a set of file ids, batching as needed.
///
/// Files that are not closed or not live are rejected here; they cannot be
/// downloaded and surfacing that early keeps the state store free of
/// entries that would never complete.
///
/// # Errors
///
/// Returns [`DescribeError`] on API failure, malformed replies, or files in
/// a non-downloadable state.
pub async fn describe_bulk(
    client: &ApiClient,
    file_ids: &[String],
) -> Result<HashMap<String, DescribedObject>, DescribeError> {
    let mut described = HashMap::with_capacity(file_ids.len());
    for batch in file_ids.chunks(MAX_OBJECTS_PER_DESCRIBE) {
        debug!(batch_len = batch.len(), "describing object batch");
        let payload = serde_json::json!({
            "objects": batch,
            "classDescribeOptions": {
                "*": {
                    "fields": {
                        "id": true,
                        "project": true,
                        "name": true,
                        "state": true,
                        "archivalState": true,
                        "size": true,
                        "parts": true,
                        "symlinkPath": true,
                        "drive": true,
                        "md5": true,
                    }
                }
            }
        });

        let body = client.call(DESCRIBE_ROUTE, &payload).await?;
        let reply: Reply = serde_json::from_slice(&body)?;

        for entry in reply.results {
            let object = validate_description(entry.describe)?;
            described.insert(object.id.clone(), object);
        }
    }
    Ok(described)
}

fn validate_description(raw: RawDescription) -> Result<DescribedObject, DescribeError> {
    if raw.state != "closed" {
        return Err(DescribeError::NotClosed {
            id: raw.id,
            state: raw.state,
        });
    }
    if raw.archival_state != "live" {
        return Err(DescribeError::NotLive {
            id: raw.id,
            state: raw.archival_state,
        });
    }

    // A `drive` field marks the file as a symlink; its content is served
    // from the symlinkPath URL and verified with the whole-file md5.
    let symlink = if raw.drive.is_some() {
        let md5 = raw.md5.ok_or_else(|| DescribeError::MissingChecksum {
            id: raw.id.clone(),
        })?;
        let url = raw
            .symlink_path
            .map(|p| p.object)
            .ok_or_else(|| DescribeError::MissingUrl {
                id: raw.id.clone(),
            })?;
        Some(SymlinkDescriptor { url, md5 })
    } else {
        None
    };

    Ok(DescribedObject {
        id: raw.id,
        project: raw.project,
        name: raw.name,
        size: raw.size,
        parts: raw.parts,
        symlink,
    })
}
