//! Error taxonomy for the retrieval engine.
//!
//! Fatal variants abort a query. The rest are absorbed by the pipeline, logged,
//! and reported back as [`Degradation`] records so callers can tell a degraded
//! answer from a failed one.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::types::EngineSource;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Corpus unreadable: {0}")]
    CorpusUnreadable(String),

    #[error("Index build failed for {fingerprint}: {reason}")]
    IndexBuildFailure { fingerprint: String, reason: String },

    #[error("{engine} engine timed out after {timeout_ms} ms")]
    EngineTimeout { engine: EngineSource, timeout_ms: u64 },

    #[error("{engine} engine failed: {reason}")]
    EngineFailure { engine: EngineSource, reason: String },

    #[error("Relevance model unavailable: {0}")]
    RerankUnavailable(String),

    #[error("No usable candidates for the query")]
    NoCandidates,

    #[error("Index cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure must abort the whole query.
    pub fn is_fatal(&self) -> bool {
        self.degradation().is_none()
    }

    /// The record reported to the caller for failures the pipeline absorbs.
    pub fn degradation(&self) -> Option<Degradation> {
        let (kind, engine) = match self {
            Error::IndexBuildFailure { .. } => (DegradationKind::IndexBuild, None),
            Error::EngineTimeout { engine, .. } => (DegradationKind::EngineTimeout, Some(*engine)),
            Error::EngineFailure { engine, .. } => (DegradationKind::EngineFailure, Some(*engine)),
            Error::RerankUnavailable(_) => (DegradationKind::RerankUnavailable, None),
            _ => return None,
        };
        Some(Degradation { kind, engine, detail: self.to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    IndexBuild,
    EngineTimeout,
    EngineFailure,
    RerankUnavailable,
}

/// A failure that was absorbed while answering a query.
#[derive(Debug, Clone, Serialize)]
pub struct Degradation {
    pub kind: DegradationKind,
    pub engine: Option<EngineSource>,
    pub detail: String,
}

/// Failures reported by external model providers (embedding, relevance).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}
