//! Platform API client.
//!
//! The whole control-plane surface is one RPC shape: POST a JSON body to a
//! named route with a bearer token, get JSON back. Failures that carry a
//! structured platform error document are decoded into
//! [`TransportError::Api`] so the user sees the platform's own error class
//! and message.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::Deserialize;
use tracing::instrument;

use crate::config::Endpoint;

use super::error::TransportError;
use super::transport::Transport;

/// `User-Agent` sent on every control-plane call, e.g. `bulkdl/0.4.1 (linux)`.
fn user_agent() -> String {
    format!(
        "bulkdl/{} ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
}

#[derive(Debug, Deserialize)]
struct ErrorDocument {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// Authenticated client for the platform API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    transport: Transport,
    endpoint: Endpoint,
}

impl ApiClient {
    /// Creates a client for the endpoint with a fresh transport.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the transport cannot be built
    /// (bad CA bundle, client construction failure).
    pub fn new(endpoint: &Endpoint) -> Result<Self, TransportError> {
        Ok(Self::with_transport(endpoint, Transport::new(endpoint)?))
    }

    /// Creates a client around an existing transport.
    #[must_use]
    pub fn with_transport(endpoint: &Endpoint, transport: Transport) -> Self {
        Self {
            transport,
            endpoint: endpoint.clone(),
        }
    }

    /// Returns the endpoint this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Calls an API route with a JSON payload and returns the raw response
    /// body.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Api`] when the platform answered with a
    /// structured error document, [`TransportError::Http`] for other bad
    /// statuses, and [`TransportError::Network`] / `Deadline` for
    /// connection-level failures.
    #[instrument(level = "debug", skip(self, payload))]
    pub async fn call(
        &self,
        route: &str,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent()).unwrap_or(HeaderValue::from_static("bulkdl")),
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.endpoint.token)).map_err(|_| {
                TransportError::Network {
                    message: "API token contains invalid header characters".to_string(),
                }
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let url = self.endpoint.api_url(route);
        let body = serde_json::to_vec(payload).map_err(|e| TransportError::Network {
            message: format!("cannot encode request payload: {e}"),
        })?;

        let result = self
            .transport
            .request(
                Method::POST,
                &url,
                headers,
                Some(body),
                self.transport.policy().control_deadline,
            )
            .await;

        match result {
            Ok(bytes) => Ok(bytes),
            Err(TransportError::Http {
                status,
                phrase,
                body,
            }) => Err(decode_platform_error(status, phrase, body)),
            Err(other) => Err(other),
        }
    }
}

/// Upgrades an HTTP error to a platform error when the body parses as the
/// platform's error document.
fn decode_platform_error(status: u16, phrase: String, body: Vec<u8>) -> TransportError {
    match serde_json::from_slice::<ErrorDocument>(&body) {
        Ok(doc) => TransportError::Api {
            kind: doc.error.kind,
            message: doc.error.message,
            status,
        },
        Err(_) => TransportError::Http {
            status,
            phrase,
            body,
        },
    }
}
