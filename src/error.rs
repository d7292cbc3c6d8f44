//! Error types for the discovery engine.
//!
//! Errors are classified by how the engine reacts to them:
//! - Transient: network issues, timeouts, rate limits (retried, then inconclusive)
//! - Data: malformed episodes, missing embeddings (record skipped)
//! - Invariant: out-of-range confidence, illegal state transitions (write rejected)
//! - Checkpoint: corrupt checkpoint file (fall back to last known-good)
//! - Configuration / Storage: surfaced to the caller of the batch entry point

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;
use crate::types::BindingState;

/// Error types for discovery, lifecycle, and persistence operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    // Transient errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Rate limit exceeded")]
    RateLimited,

    // Data errors
    #[error("Malformed episode {id}: {reason}")]
    MalformedEpisode { id: String, reason: String },

    #[error("Missing embedding for episode {0}")]
    MissingEmbedding(String),

    // Invariant violations
    #[error("{field} out of range: {value}")]
    ConfidenceOutOfRange { field: &'static str, value: f64 },

    #[error("Illegal binding transition {from} -> {to}")]
    IllegalTransition { from: BindingState, to: BindingState },

    // Checkpoint errors
    #[error("Checkpoint corrupt at {path}: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    // Caller-facing errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(String),
}

/// Coarse classification of a `DiscoveryError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Transient,
    Data,
    Invariant,
    Checkpoint,
    Configuration,
    Storage,
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiscoveryError::Network(_) | DiscoveryError::Timeout(_) | DiscoveryError::RateLimited => {
                ErrorKind::Transient
            }
            DiscoveryError::MalformedEpisode { .. } | DiscoveryError::MissingEmbedding(_) => {
                ErrorKind::Data
            }
            DiscoveryError::ConfidenceOutOfRange { .. }
            | DiscoveryError::IllegalTransition { .. } => ErrorKind::Invariant,
            DiscoveryError::CheckpointCorrupt { .. } => ErrorKind::Checkpoint,
            DiscoveryError::Configuration(_) | DiscoveryError::NotFound(_) => {
                ErrorKind::Configuration
            }
            DiscoveryError::Store(StoreError::Invariant(_)) => ErrorKind::Invariant,
            DiscoveryError::Store(_) | DiscoveryError::Io(_) => ErrorKind::Storage,
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::Io(err.to_string())
    }
}

/// Serializable error representation for batch reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedError {
    pub message: String,
    pub kind: ErrorKind,
    pub can_retry: bool,
}

impl From<&DiscoveryError> for ReportedError {
    fn from(err: &DiscoveryError) -> Self {
        ReportedError {
            message: err.to_string(),
            kind: err.kind(),
            can_retry: err.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(DiscoveryError::Network("reset".into()).is_retryable());
        assert!(DiscoveryError::Timeout(500).is_retryable());
        assert!(DiscoveryError::RateLimited.is_retryable());
    }

    #[test]
    fn test_invariant_errors_not_retryable() {
        let err = DiscoveryError::IllegalTransition {
            from: BindingState::Promoted,
            to: BindingState::Exploring,
        };
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Illegal binding transition PROMOTED -> EXPLORING");
    }

    #[test]
    fn test_store_invariant_classified_as_invariant() {
        let err = DiscoveryError::from(StoreError::Invariant("confidence 1.2".into()));
        assert_eq!(err.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn test_reported_error_carries_kind() {
        let err = DiscoveryError::MalformedEpisode {
            id: "ep-1".into(),
            reason: "empty text".into(),
        };
        let reported = ReportedError::from(&err);
        assert_eq!(reported.kind, ErrorKind::Data);
        assert!(!reported.can_retry);
        assert!(reported.message.contains("ep-1"));
    }
}
