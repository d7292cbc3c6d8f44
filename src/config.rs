//! Engine configuration (`~/.intent-discovery/config.json`).
//!
//! Every threshold the engine uses lives here with its observed default.
//! The defaults are starting points tuned empirically, not fixed contracts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub eig: EigConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub templates: TemplateConfig,
    #[serde(default)]
    pub capabilities: CapabilityConfig,
}

/// Which embedding strategy to select at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStrategyKind {
    #[default]
    Ngram,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusteringConfig {
    pub time_window_days: i64,
    pub similarity_threshold: f32,
    pub max_cluster_size: usize,
    pub min_cluster_size: usize,
    pub embedding_dimension: usize,
    pub embedding_strategy: EmbeddingStrategyKind,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            time_window_days: 45,
            similarity_threshold: 0.78,
            max_cluster_size: 10,
            min_cluster_size: 2,
            embedding_dimension: 384,
            embedding_strategy: EmbeddingStrategyKind::Ngram,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EigConfig {
    /// Business-priority multiplier per category (case-insensitive lookup).
    pub category_values: BTreeMap<String, f64>,
    pub default_category_value: f64,
    /// Evidence items after which novelty halves.
    pub novelty_half_life: f64,
    pub novelty_floor: f64,
}

impl Default for EigConfig {
    fn default() -> Self {
        let category_values = [
            ("CRM", 1.3),
            ("ERP", 1.3),
            ("cybersecurity", 1.3),
            ("cloud_migration", 1.2),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            category_values,
            default_category_value: 1.0,
            novelty_half_life: 3.0,
            novelty_floor: 0.2,
        }
    }
}

/// Fixed confidence deltas per evaluator decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecisionDeltas {
    pub accept: f64,
    pub weak_accept: f64,
    pub reject: f64,
}

impl Default for DecisionDeltas {
    fn default() -> Self {
        Self {
            accept: 0.10,
            weak_accept: 0.05,
            reject: -0.08,
        }
    }
}

/// How channel reliability is turned into a number during hop selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelExploration {
    #[default]
    Mean,
    Thompson,
}

/// Rationale pattern that spawns a more specific follow-up hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionTrigger {
    pub category: String,
    /// Regular expression matched against the evaluator rationale.
    pub pattern: String,
    pub follow_up: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    pub max_iterations: u32,
    pub target_confidence: f64,
    /// Confidence within this margin of 0 or 1 counts as saturated.
    pub saturation_margin: f64,
    pub deltas: DecisionDeltas,
    /// Use the evaluator's own delta (sign-checked, bounded) instead of the constants.
    pub use_evaluator_delta: bool,
    pub max_evaluator_delta: f64,
    /// Starting-confidence discount when a category has no direct capability match.
    pub capability_discount: f64,
    /// Starting confidence for needs declared in entity metadata but absent from the template.
    pub default_prior_confidence: f64,
    pub shortcut_boost: f64,
    /// Number of hops per hypothesis during which shortcuts bias channel ROI.
    pub shortcut_attempts: u32,
    pub channel_roi: BTreeMap<String, f64>,
    pub default_channel_roi: f64,
    pub default_channels: Vec<String>,
    pub channel_exploration: ChannelExploration,
    pub evolution_triggers: Vec<EvolutionTrigger>,
    /// Child starting confidence as a fraction of the parent's.
    pub evolution_inheritance: f64,
    pub max_evolution_depth: u8,
    /// Confidence at which a category counts as accepted for rollups.
    pub accept_threshold: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let channel_roi = [
            ("procurement_portal", 0.9),
            ("jobs_board", 0.8),
            ("company_site", 0.7),
            ("filings", 0.65),
            ("news", 0.6),
            ("social", 0.4),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            max_iterations: 12,
            target_confidence: 0.85,
            saturation_margin: 0.02,
            deltas: DecisionDeltas::default(),
            use_evaluator_delta: false,
            max_evaluator_delta: 0.25,
            capability_discount: 0.1,
            default_prior_confidence: 0.3,
            shortcut_boost: 2.0,
            shortcut_attempts: 2,
            channel_roi,
            default_channel_roi: 0.5,
            default_channels: vec![
                "jobs_board".to_string(),
                "news".to_string(),
                "company_site".to_string(),
            ],
            channel_exploration: ChannelExploration::Mean,
            evolution_triggers: vec![
                EvolutionTrigger {
                    category: "CRM".to_string(),
                    pattern: r"(?i)\b(migrat\w*|replac\w*|sunset\w*)\b".to_string(),
                    follow_up: "CRM_migration".to_string(),
                },
                EvolutionTrigger {
                    category: "cybersecurity".to_string(),
                    pattern: r"(?i)\b(breach|incident|ransomware)\b".to_string(),
                    follow_up: "incident_response".to_string(),
                },
            ],
            evolution_inheritance: 0.8,
            max_evolution_depth: 2,
            accept_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleConfig {
    pub min_usage: u64,
    pub min_success_rate: f64,
    pub min_confidence_adjustment: f64,
    /// Idle evaluations before a PROMOTED binding freezes.
    pub stale_cycle_limit: u32,
    pub retire_below_success_rate: f64,
    /// Executions since promotion required before retirement is considered.
    pub min_fresh_executions: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_usage: 3,
            min_success_rate: 0.65,
            min_confidence_adjustment: 0.05,
            stale_cycle_limit: 3,
            retire_below_success_rate: 0.35,
            min_fresh_executions: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregatorConfig {
    pub shortcut_top_n: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { shortcut_top_n: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    pub max_concurrency: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            checkpoint_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateConfig {
    /// Fraction of sampled entities that must show a category for it to enter the template.
    pub min_support: f64,
    pub validation_probe_limit: usize,
    pub min_validation_hit_rate: f64,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            min_support: 0.3,
            validation_probe_limit: 5,
            min_validation_hit_rate: 0.5,
        }
    }
}

/// Service capabilities hypotheses are matched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilityConfig {
    /// Capability name -> aliases that count as a direct match.
    pub entries: BTreeMap<String, Vec<String>>,
    /// Jaro-Winkler similarity at which a category counts as an indirect match.
    pub fuzzy_threshold: f64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        let entries = [
            ("CRM", vec!["salesforce", "hubspot", "customer relationship management"]),
            ("CRM_migration", vec!["crm replacement", "crm consolidation"]),
            ("ERP", vec!["sap", "netsuite", "enterprise resource planning"]),
            ("cybersecurity", vec!["security", "infosec", "soc"]),
            ("incident_response", vec!["breach response", "forensics"]),
            ("cloud_migration", vec!["cloud", "aws migration", "azure migration"]),
            ("data_analytics", vec!["business intelligence", "data warehouse"]),
        ]
        .into_iter()
        .map(|(k, aliases)| {
            (
                k.to_string(),
                aliases.into_iter().map(|a| a.to_string()).collect(),
            )
        })
        .collect();
        Self {
            entries,
            fuzzy_threshold: 0.85,
        }
    }
}

impl EngineConfig {
    /// Load config from an explicit path. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, DiscoveryError> {
        if !path.exists() {
            log::info!(
                "Config: no file at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| DiscoveryError::Configuration(format!("Failed to read config: {}", e)))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| DiscoveryError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `~/.intent-discovery/config.json`.
    pub fn load_default() -> Result<Self, DiscoveryError> {
        Self::load(&default_config_path()?)
    }

    /// Case-insensitive category multiplier.
    pub fn category_value(&self, category: &str) -> f64 {
        self.eig
            .category_values
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(category))
            .map(|(_, v)| *v)
            .unwrap_or(self.eig.default_category_value)
    }

    /// Static ROI for a channel before learned reliability is blended in.
    pub fn base_channel_roi(&self, channel: &str) -> f64 {
        self.discovery
            .channel_roi
            .get(channel)
            .copied()
            .unwrap_or(self.discovery.default_channel_roi)
    }

    pub fn validate(&self) -> Result<(), DiscoveryError> {
        let unit_fields: [(&str, f64); 12] = [
            ("clustering.similarityThreshold", self.clustering.similarity_threshold as f64),
            ("discovery.targetConfidence", self.discovery.target_confidence),
            ("discovery.saturationMargin", self.discovery.saturation_margin),
            ("discovery.capabilityDiscount", self.discovery.capability_discount),
            ("discovery.defaultPriorConfidence", self.discovery.default_prior_confidence),
            ("discovery.evolutionInheritance", self.discovery.evolution_inheritance),
            ("discovery.acceptThreshold", self.discovery.accept_threshold),
            ("lifecycle.minSuccessRate", self.lifecycle.min_success_rate),
            ("lifecycle.retireBelowSuccessRate", self.lifecycle.retire_below_success_rate),
            ("templates.minSupport", self.templates.min_support),
            ("templates.minValidationHitRate", self.templates.min_validation_hit_rate),
            ("capabilities.fuzzyThreshold", self.capabilities.fuzzy_threshold),
        ];
        for (name, value) in unit_fields {
            if !crate::types::is_unit(value) {
                return Err(DiscoveryError::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.clustering.time_window_days < 0 {
            return Err(DiscoveryError::Configuration(
                "clustering.timeWindowDays must be >= 0".to_string(),
            ));
        }
        if self.clustering.max_cluster_size == 0 || self.clustering.min_cluster_size == 0 {
            return Err(DiscoveryError::Configuration(
                "clustering cluster sizes must be >= 1".to_string(),
            ));
        }
        if self.clustering.embedding_dimension == 0 {
            return Err(DiscoveryError::Configuration(
                "clustering.embeddingDimension must be > 0".to_string(),
            ));
        }
        let deltas = self.discovery.deltas;
        if deltas.accept < deltas.weak_accept || deltas.weak_accept < 0.0 || deltas.reject > 0.0 {
            return Err(DiscoveryError::Configuration(format!(
                "discovery.deltas must satisfy accept >= weakAccept >= 0 >= reject, got {:?}",
                deltas
            )));
        }
        if self.eig.novelty_floor <= 0.0 || self.eig.novelty_floor > 1.0 {
            return Err(DiscoveryError::Configuration(
                "eig.noveltyFloor must be within (0, 1]".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(DiscoveryError::Configuration(
                "retry.maxAttempts must be >= 1".to_string(),
            ));
        }
        if self.batch.max_concurrency == 0 {
            return Err(DiscoveryError::Configuration(
                "batch.maxConcurrency must be >= 1".to_string(),
            ));
        }
        for trigger in &self.discovery.evolution_triggers {
            regex::Regex::new(&trigger.pattern).map_err(|e| {
                DiscoveryError::Configuration(format!(
                    "invalid evolution trigger for {}: {}",
                    trigger.category, e
                ))
            })?;
        }
        Ok(())
    }
}

/// Resolve the state directory: `~/.intent-discovery`.
pub fn state_dir() -> Result<PathBuf, DiscoveryError> {
    let home = dirs::home_dir()
        .ok_or_else(|| DiscoveryError::Configuration("Could not find home directory".to_string()))?;
    Ok(home.join(".intent-discovery"))
}

pub fn default_config_path() -> Result<PathBuf, DiscoveryError> {
    Ok(state_dir()?.join("config.json"))
}
