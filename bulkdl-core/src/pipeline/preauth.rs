//! URL preauthorization stage.
//!
//! A single task sits between the job producer and the worker pool. It
//! keeps the only copy of the `file id -> preauthorized URL` cache, so each
//! file's URL is fetched exactly once per run no matter how many parts the
//! file has or how many workers are downloading. Letting workers fill a
//! shared cache instead would race on misses and issue duplicate preauth
//! calls for the same file.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::state::{Part, RegularPart};

use super::{Job, PartFailure};

/// Validity requested for preauthorized URLs. A year outlives any run, so
/// one URL serves every part of its file.
const URL_DURATION_SECS: u64 = 60 * 60 * 24 * 365;

/// A preauthorized download URL with the headers it must be used with.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreauthUrl {
    /// The URL itself.
    pub url: String,
    /// Headers to send on every ranged request against the URL.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Runs the preauth stage until the incoming channel closes.
///
/// Regular parts get a URL attached, from the cache or a fresh
/// `{file_id}/download` call; symlink parts pass through with the URL their
/// record already carries. Parts whose preauth call fails are reported as
/// failures and skipped.
pub(crate) async fn run(
    client: ApiClient,
    mut pending: mpsc::Receiver<Part>,
    ready: mpsc::Sender<Job>,
    failures: mpsc::Sender<PartFailure>,
) {
    let mut cache: HashMap<String, PreauthUrl> = HashMap::new();

    while let Some(part) = pending.recv().await {
        let job = match part {
            Part::Regular(part) => {
                let preauth = match cache.get(&part.file_id) {
                    Some(hit) => hit.clone(),
                    None => match acquire(&client, &part).await {
                        Ok(fresh) => {
                            cache.insert(part.file_id.clone(), fresh.clone());
                            fresh
                        }
                        Err(error) => {
                            warn!(
                                file_id = %part.file_id,
                                part_id = part.part_id,
                                %error,
                                "cannot preauthorize download URL"
                            );
                            let _ = failures
                                .send(PartFailure {
                                    file_id: part.file_id.clone(),
                                    part_id: part.part_id,
                                    error: error.to_string(),
                                })
                                .await;
                            continue;
                        }
                    },
                };
                Job::Regular { part, preauth }
            }
            Part::Symlink { part, url } => Job::Symlink { part, url },
        };

        if ready.send(job).await.is_err() {
            // Worker pool is gone; nothing left to feed.
            return;
        }
    }
    debug!(cached_urls = cache.len(), "preauth stage drained");
}

async fn acquire(client: &ApiClient, part: &RegularPart) -> Result<PreauthUrl, String> {
    let route = format!("{}/download", part.file_id);
    let payload = serde_json::json!({
        "project": part.project,
        "duration": URL_DURATION_SECS,
    });
    let body = client
        .call(&route, &payload)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::from_slice(&body)
        .map_err(|e| format!("cannot parse preauthorized URL reply: {e}"))
}
