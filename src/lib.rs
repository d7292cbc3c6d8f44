//! Adaptive discovery and governance engine for procurement-intent signals.
//!
//! Per entity, hypotheses about upcoming needs are generated from the cluster
//! template, ranked by expected information gain, and tested hop by hop
//! against external evidence. Each entity's runtime binding moves through
//! EXPLORING -> PROMOTED -> FROZEN | RETIRED as its track record builds, and
//! promoted bindings feed cluster-wide discovery shortcuts back to their peers.
//!
//! `DiscoveryEngine` is the entry point; storage, content fetching and
//! evidence evaluation are injected.

pub mod checkpoint;
pub mod cluster_intel;
pub mod config;
pub mod discovery;
pub mod embeddings;
pub mod engine;
pub mod entity;
pub mod episodes;
pub mod error;
pub mod external;
pub mod lifecycle;
mod migrations;
pub mod queries;
pub mod retry;
pub mod store;
pub mod templates;
pub mod types;

pub use cluster_intel::ClusterAggregator;
pub use config::EngineConfig;
pub use discovery::{CancelToken, DiscoveryResult, Orchestrator, StopReason};
pub use engine::{BatchReport, DiscoveryEngine, EntityOutcome, RunOptions, Target};
pub use entity::Entity;
pub use error::{DiscoveryError, ErrorKind};
pub use external::{ContentFetcher, EvaluateError, Evaluation, EvidenceEvaluator, FetchError, FetchedContent};
pub use lifecycle::{LifecycleManager, Transition};
pub use queries::{Opportunity, OpportunityFilter};
pub use store::{MemoryStore, PersistentStore, SqliteStore, StoreError};
pub use types::{BindingState, Decision, Hypothesis, RuntimeBinding};
