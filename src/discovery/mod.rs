//! Discovery: hypothesis generation, EIG ranking, and the per-entity hop loop.

pub mod capabilities;
pub mod eig;
pub mod evolution;
pub mod hypotheses;
pub mod orchestrator;
pub mod reliability;

pub use capabilities::{CapabilityMap, CapabilityMatch};
pub use eig::EigPrioritizer;
pub use hypotheses::{merge_with_prior, HypothesisGenerator};
pub use orchestrator::{
    CancelToken, DiscoveryResult, HopExecution, HopOutcome, Orchestrator, PassOptions, StopReason,
};
