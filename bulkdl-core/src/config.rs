//! Endpoint descriptor for the platform API.
//!
//! The agent talks to one API server, authenticated with a bearer token.
//! The descriptor also carries the TLS knobs and the platform-job marker
//! that switch the engine between interactive and batch behavior (chunk
//! size, progress cadence, terminal rendering).

use std::path::PathBuf;

use thiserror::Error;

/// Environment variable holding the bearer token.
pub const ENV_TOKEN: &str = "BULKDL_TOKEN";
/// Environment variable holding the API server host.
pub const ENV_APISERVER_HOST: &str = "BULKDL_APISERVER_HOST";
/// Environment variable holding the API server port.
pub const ENV_APISERVER_PORT: &str = "BULKDL_APISERVER_PORT";
/// Environment variable holding the API server protocol.
pub const ENV_APISERVER_PROTOCOL: &str = "BULKDL_APISERVER_PROTOCOL";
/// Environment variable set when running inside a platform job.
pub const ENV_JOB_ID: &str = "BULKDL_JOB_ID";
/// Environment variable naming an extra CA certificate file (PEM).
pub const ENV_TLS_CERTIFICATE_FILE: &str = "BULKDL_TLS_CERTIFICATE_FILE";
/// Environment variable disabling TLS peer verification when set to "true".
pub const ENV_TLS_SKIP_VERIFY: &str = "BULKDL_TLS_SKIP_VERIFY";

/// Errors raised while assembling the endpoint descriptor.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The bearer token is missing.
    #[error("the API token is not set; export {ENV_TOKEN} or run inside a platform job")]
    MissingToken,

    /// The API server host is missing.
    #[error("the API server host is not set; export {ENV_APISERVER_HOST}")]
    MissingHost,

    /// The API server port does not parse as a port number.
    #[error("invalid API server port {value:?}")]
    InvalidPort {
        /// The offending value.
        value: String,
    },
}

/// A fully resolved API endpoint plus transport options.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Bearer token used on every control-plane call.
    pub token: String,
    /// API server host name.
    pub host: String,
    /// API server port.
    pub port: u16,
    /// API server protocol, normally `https`.
    pub protocol: String,
    /// Platform job id when running inside a job, `None` interactively.
    pub job_id: Option<String>,
    /// Extra CA certificate bundle to append to the trust roots.
    pub ca_file: Option<PathBuf>,
    /// Disable TLS peer verification. Test setups only.
    pub insecure_skip_verify: bool,
}

impl Endpoint {
    /// Builds the descriptor from the process environment.
    ///
    /// Host and token are required; the port defaults to 443 and the
    /// protocol to `https`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the token or host is absent, or the
    /// port is not numeric.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = non_empty_var(ENV_TOKEN).ok_or(ConfigError::MissingToken)?;
        let host = non_empty_var(ENV_APISERVER_HOST).ok_or(ConfigError::MissingHost)?;

        let port = match non_empty_var(ENV_APISERVER_PORT) {
            None => 443,
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort { value: raw })?,
        };
        let protocol =
            non_empty_var(ENV_APISERVER_PROTOCOL).unwrap_or_else(|| "https".to_string());

        Ok(Self {
            token,
            host,
            port,
            protocol,
            job_id: non_empty_var(ENV_JOB_ID),
            ca_file: non_empty_var(ENV_TLS_CERTIFICATE_FILE).map(PathBuf::from),
            insecure_skip_verify: non_empty_var(ENV_TLS_SKIP_VERIFY).as_deref() == Some("true"),
        })
    }

    /// Returns the absolute URL for an API route.
    #[must_use]
    pub fn api_url(&self, route: &str) -> String {
        format!("{}://{}:{}/{}", self.protocol, self.host, self.port, route)
    }

    /// True when the agent runs inside a platform job.
    ///
    /// Jobs get the larger chunk size, the slower progress cadence, and
    /// newline progress rendering.
    #[must_use]
    pub fn inside_job(&self) -> bool {
        self.job_id.is_some()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> Endpoint {
        Endpoint {
            token: "secret".to_string(),
            host: "api.example.com".to_string(),
            port: 443,
            protocol: "https".to_string(),
            job_id: None,
            ca_file: None,
            insecure_skip_verify: false,
        }
    }

    #[test]
    fn api_url_joins_route() {
        let endpoint = descriptor();
        assert_eq!(
            endpoint.api_url("system/describeDataObjects"),
            "https://api.example.com:443/system/describeDataObjects"
        );
    }

    #[test]
    fn job_marker_flips_mode() {
        let mut endpoint = descriptor();
        assert!(!endpoint.inside_job());
        endpoint.job_id = Some("job-000000000000000000000001".to_string());
        assert!(endpoint.inside_job());
    }
}
