//! HTTP transport and platform API client.

mod client;
mod error;
mod transport;

pub use client::ApiClient;
pub use error::TransportError;
pub use transport::{RetryPolicy, Transport};
