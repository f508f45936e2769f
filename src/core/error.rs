// src/core/error.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors. These surface to the caller before any probing starts.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Invalid or contradictory configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The passive response file is missing, unreadable, or holds a bad record.
    #[error("Passive response file {}: {reason}", path.display())]
    PassiveFile { path: PathBuf, reason: String },

    /// The blocking entry points could not start their runtime.
    #[error("Failed to start async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl ScanError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        ScanError::Config(message.into())
    }

    pub(crate) fn passive(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ScanError::PassiveFile {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Per-probe failures. Recorded in the unit's `ProbeResult`, never raised.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeError {
    /// No reachable endpoint (DNS failure, refused, unreachable, proxy down).
    #[error("Connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("TLS handshake with {url} failed: {reason}")]
    Tls { url: String, reason: String },

    /// Something answered, but not with a usable HTTP response.
    #[error("Malformed response from {url}: {reason}")]
    Protocol { url: String, reason: String },

    #[error("Probe cancelled")]
    Cancelled,

    /// The worker running this unit died (e.g. panicked).
    #[error("Worker failed: {reason}")]
    Worker { reason: String },
}

impl ProbeError {
    /// Short machine-readable classification.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Connect { .. } => "connect",
            ProbeError::Timeout { .. } => "timeout",
            ProbeError::Tls { .. } => "tls",
            ProbeError::Protocol { .. } => "protocol",
            ProbeError::Cancelled => "cancelled",
            ProbeError::Worker { .. } => "worker",
        }
    }
}

/// Failures of the best-effort enrichment adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("ASN lookup unavailable: {reason}")]
    LookupUnavailable { reason: String },

    #[error("Screenshot rendering timed out after {timeout_ms}ms")]
    RenderTimeout { timeout_ms: u64 },

    #[error("Screenshot rendering unavailable: {reason}")]
    RenderUnavailable { reason: String },
}
