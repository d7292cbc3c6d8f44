//! Contracts for the collaborators the engine consumes but does not own:
//! the content fetcher and the evidence evaluator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DiscoveryError;
use crate::types::{Decision, Hypothesis};

/// Content returned by a fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedContent {
    pub text: String,
    pub source_url: String,
}

/// Verdict returned by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub decision: Decision,
    pub confidence_delta: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Fetch timed out after {0} ms")]
    Timeout(u64),

    #[error("Rate limited")]
    RateLimited,

    #[error("Nothing found: {0}")]
    NotFound(String),

    #[error("Fetch rejected: {0}")]
    Rejected(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::RateLimited
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum EvaluateError {
    #[error("Evaluator unavailable: {0}")]
    Unavailable(String),

    #[error("Evaluation timed out after {0} ms")]
    Timeout(u64),

    #[error("Evaluator returned an unusable response: {0}")]
    InvalidResponse(String),
}

impl EvaluateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EvaluateError::Unavailable(_) | EvaluateError::Timeout(_))
    }
}

impl From<FetchError> for DiscoveryError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Network(msg) => DiscoveryError::Network(msg),
            FetchError::Timeout(ms) => DiscoveryError::Timeout(ms),
            FetchError::RateLimited => DiscoveryError::RateLimited,
            FetchError::NotFound(msg) => DiscoveryError::NotFound(msg),
            FetchError::Rejected(msg) => DiscoveryError::Network(format!("rejected: {msg}")),
        }
    }
}

/// Retrieves content for a query or URL over a given channel ("hop type").
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, query_or_url: &str, hop_type: &str) -> Result<FetchedContent, FetchError>;
}

/// Judges whether fetched content supports a hypothesis.
#[async_trait]
pub trait EvidenceEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        content: &FetchedContent,
        hypothesis: &Hypothesis,
        hop_type: &str,
    ) -> Result<Evaluation, EvaluateError>;
}

/// Query sent to the fetcher for a hypothesis on an entity.
pub fn build_query(entity_name: &str, hypothesis: &Hypothesis) -> String {
    let category = hypothesis.category.replace('_', " ");
    match hypothesis.mapped_capability.as_deref() {
        Some(capability) if !capability.eq_ignore_ascii_case(&hypothesis.category) => {
            format!("{} {} {}", entity_name, category, capability)
        }
        _ => format!("{} {}", entity_name, category),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hypothesis(category: &str, capability: Option<&str>) -> Hypothesis {
        Hypothesis {
            id: "hyp-1".into(),
            entity_id: "acme".into(),
            category: category.into(),
            confidence: 0.5,
            derived_from: None,
            mapped_capability: capability.map(|c| c.to_string()),
            channels: vec![],
            shortcut_channels: vec![],
            evidence_count: 0,
            depth: 0,
        }
    }

    #[test]
    fn test_fetch_error_transience() {
        assert!(FetchError::Timeout(100).is_transient());
        assert!(FetchError::RateLimited.is_transient());
        assert!(!FetchError::NotFound("jobs".into()).is_transient());
    }

    #[test]
    fn test_evaluate_error_transience() {
        assert!(EvaluateError::Unavailable("503".into()).is_transient());
        assert!(!EvaluateError::InvalidResponse("empty".into()).is_transient());
    }

    #[test]
    fn test_fetch_error_maps_to_discovery_kind() {
        let err: DiscoveryError = FetchError::Timeout(250).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_build_query() {
        assert_eq!(build_query("Acme", &hypothesis("CRM", Some("CRM"))), "Acme CRM");
        assert_eq!(
            build_query("Acme", &hypothesis("cloud_migration", Some("Cloud Services"))),
            "Acme cloud migration Cloud Services"
        );
    }
}
