//! Core data model: hypotheses, episodes, bindings, cluster intelligence, templates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Clamp a confidence-like value into `[0, 1]`. NaN collapses to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Whether a value is a finite member of `[0, 1]`.
pub fn is_unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

// =============================================================================
// Evaluator decisions
// =============================================================================

/// Verdict returned by the evidence evaluator for one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Accept,
    WeakAccept,
    Reject,
}

impl Decision {
    /// ACCEPT and WEAK_ACCEPT count as a successful execution.
    pub fn is_positive(&self) -> bool {
        matches!(self, Decision::Accept | Decision::WeakAccept)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Accept => write!(f, "ACCEPT"),
            Decision::WeakAccept => write!(f, "WEAK_ACCEPT"),
            Decision::Reject => write!(f, "REJECT"),
        }
    }
}

// =============================================================================
// Hypotheses
// =============================================================================

/// A candidate procurement need for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hypothesis {
    pub id: String,
    pub entity_id: String,
    pub category: String,
    pub confidence: f64,
    /// Parent hypothesis for evolved follow-ups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped_capability: Option<String>,
    /// Channels the template suggests for this category.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Cluster shortcut order; non-empty means blind exploration is skipped.
    #[serde(default)]
    pub shortcut_channels: Vec<String>,
    /// Evidence items gathered so far (drives novelty).
    #[serde(default)]
    pub evidence_count: u32,
    /// Evolution depth, 0 for generated hypotheses.
    #[serde(default)]
    pub depth: u8,
}

// =============================================================================
// Episodes
// =============================================================================

/// One immutable unit of fetched evidence tied to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub entity_id: String,
    pub hop_type: String,
    pub source_url: String,
    pub timestamp: DateTime<Utc>,
    pub raw_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Inclusive time range covered by a clustered episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One or more raw episodes compressed into a single timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteredEpisode {
    pub cluster_members: Vec<String>,
    pub representative_embedding: Vec<f32>,
    pub time_span: TimeSpan,
    /// Most recent member's timestamp.
    pub timestamp: DateTime<Utc>,
    /// Member texts, most recent first.
    pub consolidated_text: String,
    pub hop_types: Vec<String>,
    pub source_urls: Vec<String>,
}

impl ClusteredEpisode {
    pub fn is_consolidated(&self) -> bool {
        self.cluster_members.len() > 1
    }
}

/// An episode left out of clustering, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedEpisode {
    pub episode_id: String,
    pub reason: String,
}

/// Output of the episode clusterer for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteredTimeline {
    pub entity_id: String,
    /// Ordered by representative timestamp, oldest first.
    pub episodes: Vec<ClusteredEpisode>,
    pub raw_episode_count: usize,
    #[serde(default)]
    pub skipped: Vec<SkippedEpisode>,
}

impl ClusteredTimeline {
    pub fn empty(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            episodes: Vec::new(),
            raw_episode_count: 0,
            skipped: Vec::new(),
        }
    }

    /// raw_episode_count / clustered_episode_count (1.0 for an empty timeline).
    pub fn compression_ratio(&self) -> f64 {
        if self.episodes.is_empty() {
            return 1.0;
        }
        self.raw_episode_count as f64 / self.episodes.len() as f64
    }
}

// =============================================================================
// Runtime bindings
// =============================================================================

/// Lifecycle state of a runtime binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingState {
    Exploring,
    Promoted,
    Frozen,
    Retired,
}

impl std::fmt::Display for BindingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BindingState {
    /// String label for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::Exploring => "EXPLORING",
            BindingState::Promoted => "PROMOTED",
            BindingState::Frozen => "FROZEN",
            BindingState::Retired => "RETIRED",
        }
    }
}

impl std::str::FromStr for BindingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "EXPLORING" => Ok(BindingState::Exploring),
            "PROMOTED" => Ok(BindingState::Promoted),
            "FROZEN" => Ok(BindingState::Frozen),
            "RETIRED" => Ok(BindingState::Retired),
            _ => Err(format!("Unknown binding state: {}", s)),
        }
    }
}

/// Per-channel execution counters kept on a binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub attempts: u64,
    pub successes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl ChannelStats {
    pub fn failures(&self) -> u64 {
        self.attempts.saturating_sub(self.successes)
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

/// Learned per-entity shortcuts and trust state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeBinding {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub state: BindingState,
    pub usage_count: u64,
    pub success_count: u64,
    pub confidence_adjustment: f64,
    #[serde(default)]
    pub discovered_channels: BTreeMap<String, ChannelStats>,
    #[serde(default)]
    pub discovery_shortcuts: Vec<String>,
    /// Best confidence reached per accepted category.
    #[serde(default)]
    pub category_confidence: BTreeMap<String, f64>,
    /// Consecutive lifecycle evaluations with no new executions.
    #[serde(default)]
    pub idle_cycles: u32,
    /// usage_count at the moment of promotion.
    #[serde(default)]
    pub usage_at_promotion: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_hypothesis_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeBinding {
    /// A fresh binding in EXPLORING state.
    pub fn new(entity_id: &str, template_id: Option<String>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            template_id,
            state: BindingState::Exploring,
            usage_count: 0,
            success_count: 0,
            confidence_adjustment: 0.0,
            discovered_channels: BTreeMap::new(),
            discovery_shortcuts: Vec::new(),
            category_confidence: BTreeMap::new(),
            idle_cycles: 0,
            usage_at_promotion: 0,
            last_processed_hypothesis_id: None,
            updated_at: Utc::now(),
        }
    }

    /// `success_count / usage_count`, 0 when unused.
    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.usage_count as f64
    }

    /// Executions recorded since the binding was promoted.
    pub fn fresh_executions(&self) -> u64 {
        self.usage_count.saturating_sub(self.usage_at_promotion)
    }

    /// Reject records that break the numeric invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.entity_id.trim().is_empty() {
            return Err("binding has empty entity_id".to_string());
        }
        if self.success_count > self.usage_count {
            return Err(format!(
                "success_count {} exceeds usage_count {}",
                self.success_count, self.usage_count
            ));
        }
        if !self.confidence_adjustment.is_finite() || self.confidence_adjustment < 0.0 {
            return Err(format!(
                "confidence_adjustment {} must be finite and >= 0",
                self.confidence_adjustment
            ));
        }
        for (category, confidence) in &self.category_confidence {
            if !is_unit(*confidence) {
                return Err(format!("category {} confidence {} out of [0,1]", category, confidence));
            }
        }
        for (channel, stats) in &self.discovered_channels {
            if stats.successes > stats.attempts {
                return Err(format!("channel {} successes exceed attempts", channel));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Cluster intelligence
// =============================================================================

/// What one promoted binding contributed to its cluster aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingContribution {
    /// Per-channel success rate on that binding.
    pub channel_success: BTreeMap<String, f64>,
    /// Confidence achieved per accepted category.
    pub category_confidence: BTreeMap<String, f64>,
}

/// Running sum/count pair behind an incremental mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    pub sum: f64,
    pub count: u64,
}

impl RunningMean {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }
}

/// Cluster-level statistics rolled up from PROMOTED bindings only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIntelligence {
    pub cluster_id: String,
    pub channel_effectiveness: BTreeMap<String, f64>,
    pub signal_reliability: BTreeMap<String, f64>,
    /// Channels ranked by effectiveness, best first.
    pub discovery_shortcuts: Vec<String>,
    #[serde(default)]
    pub channel_totals: BTreeMap<String, RunningMean>,
    #[serde(default)]
    pub category_totals: BTreeMap<String, RunningMean>,
    /// Entity id -> contribution, for exact removal on demotion.
    #[serde(default)]
    pub contributors: BTreeMap<String, BindingContribution>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterIntelligence {
    pub fn empty(cluster_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            channel_effectiveness: BTreeMap::new(),
            signal_reliability: BTreeMap::new(),
            discovery_shortcuts: Vec::new(),
            channel_totals: BTreeMap::new(),
            category_totals: BTreeMap::new(),
            contributors: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn promoted_count(&self) -> usize {
        self.contributors.len()
    }
}

// =============================================================================
// Templates
// =============================================================================

/// An expected signal category within a cluster template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPattern {
    pub category: String,
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
}

/// Outcome of probing a template against external evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationMetadata {
    pub probes: u32,
    pub hits: u32,
    pub inconclusive: u32,
    pub hit_rate: f64,
    pub passed: bool,
    pub validated_at: DateTime<Utc>,
    #[serde(default)]
    pub sample_size: usize,
}

/// Cluster-level description of expected signals and channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub cluster_id: String,
    pub version: u32,
    pub signal_patterns: Vec<SignalPattern>,
    pub channels: Vec<String>,
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_metadata: Option<ValidationMetadata>,
}

impl Template {
    pub fn pattern_for(&self, category: &str) -> Option<&SignalPattern> {
        self.signal_patterns
            .iter()
            .find(|p| p.category.eq_ignore_ascii_case(category))
    }
}
