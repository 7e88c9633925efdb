//! Error taxonomy for the provider subsystem.
//!
//! Providers never propagate these to callers — see [`crate::providers`] —
//! but the variants give the ambient logging a stable vocabulary to key
//! on, matching the failure kinds in the error-handling design.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("required executable not found on PATH: {0}")]
    BinaryMissing(String),

    #[error("failed to spawn or allocate a pty for the child process")]
    SpawnFailure(#[source] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("expected pattern not found while parsing provider output: {0}")]
    ParseMiss(String),

    #[error("expected resource not found: {0}")]
    NotFound(String),
}
