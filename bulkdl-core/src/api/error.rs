//! Error taxonomy for the HTTP transport and the platform API client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by transport and control-plane requests.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server answered with a non-2xx status.
    #[error("HTTP {status} {phrase}")]
    Http {
        /// Numeric status code.
        status: u16,
        /// Status phrase, e.g. `Service Unavailable`.
        phrase: String,
        /// Response body, capped at the error-parsing limit.
        body: Vec<u8>,
    },

    /// The platform returned a structured error document.
    #[error("platform error {kind}: {message} (HTTP {status})")]
    Api {
        /// Error class reported by the platform, e.g. `InvalidInput`.
        kind: String,
        /// Human-readable message reported by the platform.
        message: String,
        /// HTTP status the document arrived with.
        status: u16,
    },

    /// DNS failure, broken connection, or any other client-level error.
    #[error("network error: {message}")]
    Network {
        /// Description of the underlying failure.
        message: String,
    },

    /// The overall request deadline expired; the in-flight attempt was
    /// cancelled.
    #[error("request did not complete within {after:?}")]
    Deadline {
        /// The deadline that expired.
        after: Duration,
    },

    /// A ranged fetch kept returning fewer bytes than requested.
    #[error("short read: expected {expected} bytes, got {got} after {attempts} attempts")]
    ShortRead {
        /// Bytes requested via the range header.
        expected: u64,
        /// Bytes last received.
        got: u64,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The extra CA certificate file could not be loaded.
    #[error("cannot load CA certificate {}: {source}", path.display())]
    CaCertificate {
        /// Path of the certificate file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    /// Wraps a client error as a network failure.
    pub(crate) fn network(err: &reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }

    /// True for errors that mean the part may succeed on a later run.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Deadline { .. } | Self::ShortRead { .. }
        )
    }
}
