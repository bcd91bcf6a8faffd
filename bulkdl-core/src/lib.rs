//! Resumable parallel bulk download engine.
//!
//! Given a manifest enumerating platform files, the engine downloads every
//! file to the local filesystem, verifies content integrity, and persists
//! per-part progress in an embedded state store so an interrupted run
//! resumes without redoing completed work.
//!
//! # Architecture
//!
//! - [`config`] - endpoint descriptor and environment loading
//! - [`api`] - ranged HTTP transport and the platform API client
//! - [`describe`] - batched object description
//! - [`manifest`] - manifest ingestion and validation
//! - [`state`] - the SQLite-backed part-level state store
//! - [`plan`] - part planning, placeholder files, pool sizing
//! - [`pipeline`] - the concurrent download pipeline
//! - [`verify`] - post-download integrity verification
//! - [`session`] - lifecycle object tying the above together

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]

pub mod api;
pub mod checksum;
pub mod config;
pub mod describe;
pub mod manifest;
pub mod pipeline;
pub mod plan;
pub mod session;
pub mod state;
pub mod units;
pub mod verify;

#[cfg(test)]
#[allow(clippy::expect_used)]
pub(crate) mod testutil;

// Re-export the types most callers need.
pub use api::{ApiClient, RetryPolicy, Transport, TransportError};
pub use config::{ConfigError, Endpoint};
pub use manifest::{read_manifest, DescribedFile, ManifestError};
pub use pipeline::{DownloadOutcome, PartFailure, PipelineConfig};
pub use session::{Options, Session, SessionError};
pub use state::{store_path, StateStore};
pub use units::format_bytes;
pub use verify::{verify, VerifyIssue, VerifyReport};
