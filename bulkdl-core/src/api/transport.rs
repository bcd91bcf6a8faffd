//! Ranged HTTP transport with layered retries.
//!
//! Layers, outer to inner:
//! 1. an overall deadline that cancels the in-flight attempt and stops the
//!    retry loop (6 minutes for object storage, 10 minutes for the API),
//! 2. a short-read loop for ranged fetches that deliver fewer bytes than
//!    the requested range,
//! 3. an attempt loop with bounded exponential backoff over retryable
//!    statuses and connection resets,
//! 4. the single HTTP attempt.
//!
//! One `Transport` wraps one pooled client. Workers each own a transport;
//! sharing one would contend on the connection pool and pile up file
//! descriptors.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Certificate, Client, Method};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Endpoint;
use crate::units::Backoff;

use super::error::TransportError;

/// Connect timeout for every attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle pooled connections are dropped after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Largest response body read for error reporting.
const MAX_ERROR_BODY: usize = 16 * 1024;

/// Retry limits and deadlines for one transport.
///
/// The defaults are the production values; tests shrink the delays to keep
/// retry scenarios fast.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Attempts when the delivered range length is wrong.
    pub short_read_retries: u32,
    /// Pause between short-read attempts.
    pub short_read_pause: Duration,
    /// Rounds of the whole deadline envelope for ranged fetches.
    pub deadline_rounds: u32,
    /// Pause between deadline rounds.
    pub deadline_pause: Duration,
    /// Overall deadline for object-storage requests.
    pub data_deadline: Duration,
    /// Overall deadline for platform API requests.
    pub control_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(600),
            short_read_retries: 10,
            short_read_pause: Duration::from_secs(5),
            deadline_rounds: 2,
            deadline_pause: Duration::from_secs(20),
            data_deadline: Duration::from_secs(6 * 60),
            control_deadline: Duration::from_secs(10 * 60),
        }
    }
}

/// A pooled HTTP client plus its retry policy.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    policy: RetryPolicy,
}

impl Transport {
    /// Builds a transport with the endpoint's TLS options and the default
    /// retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CaCertificate`] if the extra CA bundle
    /// cannot be read, or [`TransportError::Network`] if the client cannot
    /// be constructed.
    pub fn new(endpoint: &Endpoint) -> Result<Self, TransportError> {
        Self::with_policy(endpoint, RetryPolicy::default())
    }

    /// Builds a transport with an explicit retry policy.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Transport::new`].
    pub fn with_policy(endpoint: &Endpoint, policy: RetryPolicy) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT);

        if let Some(ca_path) = &endpoint.ca_file {
            let pem = std::fs::read(ca_path).map_err(|source| TransportError::CaCertificate {
                path: ca_path.clone(),
                source,
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| TransportError::network(&e))?;
            builder = builder.add_root_certificate(cert);
        }
        if endpoint.insecure_skip_verify {
            warn!("TLS peer verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|e| TransportError::network(&e))?;
        Ok(Self { client, policy })
    }

    /// Returns the active retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Issues a request under `deadline` and returns the full response body.
    ///
    /// Used for control-plane calls; retryable failures are absorbed by the
    /// backoff loop until the deadline cancels the whole exchange.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Deadline`] on expiry, otherwise the error
    /// of the last attempt.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        match timeout(deadline, self.request_inner(&method, url, &headers, body)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Deadline { after: deadline }),
        }
    }

    async fn request_inner(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, TransportError> {
        let response = self
            .send_with_retry(method, url, headers, body.as_deref())
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::network(&e))?;
        Ok(bytes.to_vec())
    }

    /// Fetches the byte range `[offset, offset + len)` of `url` into `buf`.
    ///
    /// `extra_headers` are the preauthorized-URL headers; the range header
    /// is added on top. The buffer is cleared first and reused across calls
    /// so steady-state fetching does not allocate.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Deadline`] when every deadline round
    /// expired, [`TransportError::ShortRead`] when the delivered length
    /// never matched, or the terminal attempt error.
    pub async fn fetch_range(
        &self,
        url: &str,
        extra_headers: &HashMap<String, String>,
        offset: u64,
        len: u64,
        buf: &mut Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut headers = build_header_map(extra_headers)?;
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        headers.insert(
            RANGE,
            HeaderValue::from_str(&range).map_err(|_| TransportError::Network {
                message: format!("invalid range header {range:?}"),
            })?,
        );

        for round in 1..=self.policy.deadline_rounds {
            match timeout(
                self.policy.data_deadline,
                self.fetch_range_attempts(url, &headers, len, buf),
            )
            .await
            {
                Ok(result) => return result,
                Err(_) => {
                    warn!(
                        url,
                        round,
                        deadline_secs = self.policy.data_deadline.as_secs(),
                        fetched = buf.len(),
                        expected = len,
                        "ranged fetch hit the overall deadline"
                    );
                    if round < self.policy.deadline_rounds {
                        tokio::time::sleep(self.policy.deadline_pause).await;
                    }
                }
            }
        }
        Err(TransportError::Deadline {
            after: self.policy.data_deadline,
        })
    }

    /// Short-read loop: re-issues the ranged request until the delivered
    /// length matches.
    async fn fetch_range_attempts(
        &self,
        url: &str,
        headers: &HeaderMap,
        len: u64,
        buf: &mut Vec<u8>,
    ) -> Result<(), TransportError> {
        for attempt in 1..=self.policy.short_read_retries {
            let response = self
                .send_with_retry(&Method::GET, url, headers, None)
                .await?;

            buf.clear();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| TransportError::network(&e))?;
                buf.extend_from_slice(&chunk);
            }

            if buf.len() as u64 == len {
                return Ok(());
            }
            warn!(
                url,
                attempt,
                got = buf.len(),
                expected = len,
                "received length is wrong, retrying"
            );
            tokio::time::sleep(self.policy.short_read_pause).await;
        }
        Err(TransportError::ShortRead {
            expected: len,
            got: buf.len() as u64,
            attempts: self.policy.short_read_retries,
        })
    }

    /// Attempt loop with bounded exponential backoff.
    async fn send_with_retry(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<reqwest::Response, TransportError> {
        let mut backoff = Backoff::new(self.policy.initial_backoff, self.policy.backoff_cap);
        let mut last_error = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let delay = backoff.next_delay();
                debug!(url, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.request(method.clone(), url).headers(headers.clone());
            if let Some(data) = body {
                request = request.body(data.to_vec());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let phrase = status.canonical_reason().unwrap_or("").to_string();
                    let body = read_error_body(response).await;
                    let error = TransportError::Http {
                        status: status.as_u16(),
                        phrase,
                        body,
                    };
                    if !retryable_status(method, status.as_u16()) {
                        return Err(error);
                    }
                    debug!(url, status = status.as_u16(), attempt, "retryable status");
                    last_error = Some(error);
                }
                Err(err) => {
                    if !retryable_connection_error(&err) {
                        return Err(TransportError::network(&err));
                    }
                    debug!(url, error = %err, attempt, "retryable connection error");
                    last_error = Some(TransportError::network(&err));
                }
            }
        }

        warn!(url, retries = self.policy.max_retries, "request failed after all retries");
        Err(last_error.unwrap_or(TransportError::Network {
            message: "retry budget exhausted".to_string(),
        }))
    }
}

/// Retryable statuses. 400 is retried only for PUT, where object storage is
/// known to close long uploads prematurely.
fn retryable_status(method: &Method, status: u16) -> bool {
    match status {
        408 | 423 | 429 | 500 | 502 | 503 | 504 => true,
        400 => *method == Method::PUT,
        _ => false,
    }
}

/// Connection-level errors are retried only for refused or reset
/// connections; anything else (DNS, TLS, malformed URL) is fatal.
fn retryable_connection_error(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
            );
        }
        source = inner.source();
    }
    false
}

fn build_header_map(extra: &HashMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::with_capacity(extra.len() + 1);
    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| TransportError::Network {
            message: format!("invalid header name {name:?}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| TransportError::Network {
            message: format!("invalid header value for {name:?}"),
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

async fn read_error_body(response: reqwest::Response) -> Vec<u8> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(Ok(chunk)) = stream.next().await {
        let room = MAX_ERROR_BODY - body.len();
        if room == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    body
}
