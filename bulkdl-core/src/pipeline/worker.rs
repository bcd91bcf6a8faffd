//! Download workers.
//!
//! Each worker owns a pooled HTTP transport and one scratch buffer of the
//! configured chunk size, reused for every fetch. Regular parts larger than
//! the chunk size are pulled in several ranged requests, all feeding one
//! streaming MD5 that is compared against the part's expected digest at the
//! end; a mismatch re-downloads the whole part up to three times. Symlink
//! chunks are at most one chunk by construction and have no per-part
//! digest.
//!
//! Workers never abort the run. Every failure is recorded per part and the
//! worker moves on to the next job.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::api::{Transport, TransportError};
use crate::checksum::StreamingMd5;
use crate::state::{local_path, now_ns, CompletedPart, PartKind, RegularPart, SymlinkPart};

use super::preauth::PreauthUrl;
use super::{Job, PartFailure};

/// Whole-part attempts when the downloaded content fails its checksum.
const PART_CHECKSUM_ATTEMPTS: u32 = 3;

/// Failure of a single part download.
#[derive(Debug, Error)]
pub(crate) enum WorkerError {
    /// The transfer itself failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The target file could not be opened or written.
    #[error("cannot write {}: {source}", path.display())]
    Io {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The content digest never matched the expected one.
    #[error("md5 mismatch for part {part_id} after {attempts} attempts")]
    ChecksumMismatch {
        /// Part id within the file.
        part_id: i64,
        /// Attempts made.
        attempts: u32,
    },
}

/// One member of the worker pool.
pub(crate) struct Worker {
    id: usize,
    transport: Transport,
    chunk_size: u64,
    buf: Vec<u8>,
}

impl Worker {
    pub(crate) fn new(id: usize, transport: Transport, chunk_size: u64) -> Self {
        Self {
            id,
            transport,
            chunk_size,
            buf: Vec::with_capacity(chunk_size as usize),
        }
    }

    /// Pulls jobs off the shared channel until it closes.
    pub(crate) async fn run(
        mut self,
        jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
        done: mpsc::Sender<CompletedPart>,
        failures: mpsc::Sender<PartFailure>,
    ) {
        loop {
            let job = {
                let mut rx = jobs.lock().await;
                rx.recv().await
            };
            let Some(job) = job else {
                debug!(worker = self.id, "job channel closed, worker exiting");
                return;
            };

            let (file_id, part_id) = job.key();
            match self.download(&job).await {
                Ok(completed) => {
                    if done.send(completed).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    warn!(
                        worker = self.id,
                        file_id = %file_id,
                        part_id,
                        %error,
                        "part download failed"
                    );
                    let _ = failures
                        .send(PartFailure {
                            file_id,
                            part_id,
                            error: error.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    async fn download(&mut self, job: &Job) -> Result<CompletedPart, WorkerError> {
        match job {
            Job::Regular { part, preauth } => self.download_regular(part, preauth).await,
            Job::Symlink { part, url } => self.download_symlink(part, url).await,
        }
    }

    async fn download_regular(
        &mut self,
        part: &RegularPart,
        preauth: &PreauthUrl,
    ) -> Result<CompletedPart, WorkerError> {
        let path = local_path(&part.folder, &part.name);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|source| WorkerError::Io {
                path: path.clone(),
                source,
            })?;

        let offset = part.offset as u64;
        let size = part.size as u64;

        for attempt in 1..=PART_CHECKSUM_ATTEMPTS {
            let mut hasher = StreamingMd5::new();
            let mut fetched = 0u64;

            while fetched < size {
                let len = self.chunk_size.min(size - fetched);
                self.transport
                    .fetch_range(
                        &preauth.url,
                        &preauth.headers,
                        offset + fetched,
                        len,
                        &mut self.buf,
                    )
                    .await?;
                write_at(&mut file, &path, offset + fetched, &self.buf).await?;
                hasher.update(&self.buf);
                fetched += len;
            }

            let digest = hasher.finish();
            if digest == part.md5 {
                return Ok(CompletedPart {
                    kind: PartKind::Regular,
                    file_id: part.file_id.clone(),
                    part_id: part.part_id,
                    size: part.size,
                    done_time_ns: now_ns(),
                });
            }
            warn!(
                file_id = %part.file_id,
                part_id = part.part_id,
                attempt,
                expected = %part.md5,
                got = %digest,
                "part content failed its checksum, re-downloading"
            );
        }

        Err(WorkerError::ChecksumMismatch {
            part_id: part.part_id,
            attempts: PART_CHECKSUM_ATTEMPTS,
        })
    }

    async fn download_symlink(
        &mut self,
        part: &SymlinkPart,
        url: &str,
    ) -> Result<CompletedPart, WorkerError> {
        let path = local_path(&part.folder, &part.name);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|source| WorkerError::Io {
                path: path.clone(),
                source,
            })?;

        let headers = std::collections::HashMap::new();
        self.transport
            .fetch_range(
                url,
                &headers,
                part.offset as u64,
                part.size as u64,
                &mut self.buf,
            )
            .await?;
        write_at(&mut file, &path, part.offset as u64, &self.buf).await?;

        Ok(CompletedPart {
            kind: PartKind::Symlink,
            file_id: part.file_id.clone(),
            part_id: part.part_id,
            size: part.size,
            done_time_ns: now_ns(),
        })
    }
}

/// Positional write. Parts never overlap, so concurrent workers can write
/// the same file through separate handles without locking.
async fn write_at(
    file: &mut tokio::fs::File,
    path: &std::path::Path,
    offset: u64,
    data: &[u8],
) -> Result<(), WorkerError> {
    let io_err = |source| WorkerError::Io {
        path: path.to_path_buf(),
        source,
    };
    file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
    file.write_all(data).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{header, method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::api::RetryPolicy;
    use crate::checksum::md5_hex;
    use crate::config::Endpoint;
    use crate::testutil::CwdGuard;

    use super::*;

    fn fast_transport() -> Transport {
        let endpoint = Endpoint {
            token: "t".to_string(),
            host: "localhost".to_string(),
            port: 1,
            protocol: "http".to_string(),
            job_id: None,
            ca_file: None,
            insecure_skip_verify: false,
        };
        let policy = RetryPolicy {
            max_retries: 0,
            initial_backoff: std::time::Duration::from_millis(1),
            short_read_pause: std::time::Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        Transport::with_policy(&endpoint, policy).unwrap()
    }

    fn part_for(data: &[u8], name: &str) -> RegularPart {
        RegularPart {
            file_id: "file-0001".to_string(),
            project: "project-1".to_string(),
            name: name.to_string(),
            folder: "/data".to_string(),
            part_id: 1,
            offset: 0,
            size: data.len() as i64,
            md5: md5_hex(data),
            bytes_fetched: 0,
            done_time_ns: 0,
        }
    }

    /// Creates `./data/{name}` under the current (temp) directory.
    async fn placeholder(name: &str) {
        tokio::fs::create_dir_all("./data").await.unwrap();
        tokio::fs::File::create(format!("./data/{name}")).await.unwrap();
    }

    #[tokio::test]
    async fn regular_part_downloads_and_verifies() {
        let server = MockServer::start().await;
        let data = b"regular part content".to_vec();
        Mock::given(method("GET"))
            .and(url_path("/blob"))
            .and(header("Range", format!("bytes=0-{}", data.len() - 1).as_str()))
            .and(header("x-auth", "signed"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(data.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(dir.path());
        placeholder("out.bin").await;

        let preauth = PreauthUrl {
            url: format!("{}/blob", server.uri()),
            headers: std::collections::HashMap::from([(
                "x-auth".to_string(),
                "signed".to_string(),
            )]),
        };
        let mut worker = Worker::new(0, fast_transport(), 1024);
        let completed = worker
            .download_regular(&part_for(&data, "out.bin"), &preauth)
            .await
            .unwrap();
        assert_eq!(completed.size, data.len() as i64);
        assert!(completed.done_time_ns > 0);

        let written = tokio::fs::read("./data/out.bin").await.unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn large_part_is_fetched_in_chunks() {
        let server = MockServer::start().await;
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 241) as u8).collect();
        // Chunk size 1000: ranges 0-999, 1000-1999, 2000-2499.
        for (start, end) in [(0u64, 999u64), (1000, 1999), (2000, 2499)] {
            Mock::given(method("GET"))
                .and(header("Range", format!("bytes={start}-{end}").as_str()))
                .respond_with(
                    ResponseTemplate::new(206)
                        .set_body_bytes(data[start as usize..=end as usize].to_vec()),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(dir.path());
        placeholder("chunked.bin").await;

        let preauth = PreauthUrl {
            url: format!("{}/blob", server.uri()),
            headers: std::collections::HashMap::new(),
        };
        let mut worker = Worker::new(0, fast_transport(), 1000);
        worker
            .download_regular(&part_for(&data, "chunked.bin"), &preauth)
            .await
            .unwrap();

        let written = tokio::fs::read("./data/chunked.bin").await.unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn corrupt_content_exhausts_part_attempts() {
        let server = MockServer::start().await;
        let data = b"expected content".to_vec();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"corrupted conten".to_vec()))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(dir.path());
        placeholder("corrupt.bin").await;

        let preauth = PreauthUrl {
            url: format!("{}/blob", server.uri()),
            headers: std::collections::HashMap::new(),
        };
        let mut worker = Worker::new(0, fast_transport(), 1024);
        let err = worker
            .download_regular(&part_for(&data, "corrupt.bin"), &preauth)
            .await
            .unwrap_err();
        assert!(
            matches!(err, WorkerError::ChecksumMismatch { attempts: 3, .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn symlink_chunk_writes_at_offset() {
        let server = MockServer::start().await;
        let chunk = vec![7u8; 16];
        Mock::given(method("GET"))
            .and(header("Range", "bytes=16-31"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(chunk.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(dir.path());
        tokio::fs::create_dir_all("./data").await.unwrap();
        tokio::fs::write("./data/linked.bin", vec![0u8; 32]).await.unwrap();

        let part = SymlinkPart {
            file_id: "file-0002".to_string(),
            project: "project-1".to_string(),
            name: "linked.bin".to_string(),
            folder: "/data".to_string(),
            part_id: 2,
            offset: 16,
            size: 16,
            bytes_fetched: 0,
            done_time_ns: 0,
        };

        let mut worker = Worker::new(0, fast_transport(), 1024);
        let completed = worker
            .download_symlink(&part, &format!("{}/linked", server.uri()))
            .await
            .unwrap();
        assert_eq!(completed.kind, PartKind::Symlink);

        let written = tokio::fs::read("./data/linked.bin").await.unwrap();
        assert_eq!(&written[..16], &[0u8; 16]);
        assert_eq!(&written[16..], chunk.as_slice());
    }
}
