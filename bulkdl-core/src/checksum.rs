//! Streaming MD5 helpers.
//!
//! All content verification in the agent is MD5-based: regular file parts
//! carry a per-part digest, symlink files carry a single whole-file digest.
//! Files are hashed in fixed-size read chunks so verification never loads a
//! whole part into memory at once.

use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

/// Read-chunk size used when hashing on-disk content.
const HASH_READ_CHUNK: usize = 1024 * 1024;

/// Returns the lowercase hex MD5 digest of a byte slice.
#[must_use]
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Incrementally computed MD5 digest.
///
/// Used by download workers to hash a part across several ranged fetches
/// without keeping more than one chunk in memory.
pub struct StreamingMd5 {
    inner: md5::Context,
}

impl StreamingMd5 {
    /// Creates a fresh digest state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: md5::Context::new(),
        }
    }

    /// Feeds more bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.consume(data);
    }

    /// Finishes the digest and returns it as lowercase hex.
    #[must_use]
    pub fn finish(self) -> String {
        format!("{:x}", self.inner.compute())
    }
}

/// Computes the MD5 of an entire on-disk file.
///
/// # Errors
///
/// Returns the underlying I/O error if the file cannot be opened or read.
pub async fn md5_of_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path).await?;
    let mut reader = BufReader::with_capacity(HASH_READ_CHUNK, file);
    let mut hasher = StreamingMd5::new();
    let mut buffer = vec![0u8; HASH_READ_CHUNK];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finish())
}

/// Computes the MD5 of the byte range `[offset, offset + len)` of a file.
///
/// # Errors
///
/// Returns the underlying I/O error, including `UnexpectedEof` when the file
/// is shorter than the requested range.
pub async fn md5_of_range(path: &Path, offset: u64, len: u64) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut hasher = StreamingMd5::new();
    let mut remaining = len;
    let mut buffer = vec![0u8; HASH_READ_CHUNK];

    while remaining > 0 {
        let want = remaining.min(HASH_READ_CHUNK as u64) as usize;
        file.read_exact(&mut buffer[..want]).await?;
        hasher.update(&buffer[..want]);
        remaining -= want as u64;
    }
    Ok(hasher.finish())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_known_vector() {
        // RFC 1321 test vector.
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = vec![0xabu8; 3 * HASH_READ_CHUNK + 17];
        let mut streaming = StreamingMd5::new();
        for piece in data.chunks(1000) {
            streaming.update(piece);
        }
        assert_eq!(streaming.finish(), md5_hex(&data));
    }

    #[tokio::test]
    async fn file_and_range_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        assert_eq!(md5_of_file(&path).await.unwrap(), md5_hex(&data));
        assert_eq!(
            md5_of_range(&path, 1000, 50_000).await.unwrap(),
            md5_hex(&data[1000..51_000])
        );
    }

    #[tokio::test]
    async fn range_past_eof_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        tokio::fs::write(&path, b"tiny").await.unwrap();

        let err = md5_of_range(&path, 0, 100).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
