//! Hop Selector / Discovery Orchestrator.
//!
//! One discovery pass for one entity:
//!
//! ```text
//! SELECT_HYPOTHESIS -> SELECT_HOP -> FETCH -> EVALUATE -> UPDATE_CONFIDENCE -> (loop | STOP)
//! ```
//!
//! Iterations are strictly sequential; FETCH and EVALUATE are the only
//! suspension points. Cancellation is observed between iterations only, and
//! confidence updates already applied are kept. A failed hop (after bounded
//! retries for transient errors) is recorded as inconclusive and the pass
//! continues.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::config::{DiscoveryConfig, EngineConfig};
use crate::entity::Entity;
use crate::episodes::ingest::episode_id;
use crate::external::{build_query, ContentFetcher, Evaluation, EvidenceEvaluator, FetchedContent};
use crate::retry::with_backoff;
use crate::types::{clamp_unit, ChannelStats, Decision, Episode, Hypothesis};

use super::capabilities::CapabilityMap;
use super::eig::EigPrioritizer;
use super::evolution::EvolutionRules;
use super::reliability::{channel_reliability, effective_roi};

/// Cooperative cancellation flag, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    Exhausted,
    TargetReached,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HopOutcome {
    Evaluated { decision: Decision },
    Inconclusive { reason: String },
}

/// One executed hop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HopExecution {
    pub iteration: u32,
    pub hypothesis_id: String,
    pub category: String,
    pub hop_type: String,
    pub hop_score: f64,
    /// Chosen from the cluster's shortcut order rather than by exploration.
    pub via_shortcut: bool,
    pub outcome: HopOutcome,
    pub confidence_before: f64,
    pub confidence_after: f64,
    #[serde(default)]
    pub rationale: String,
}

impl HopExecution {
    pub fn decision(&self) -> Option<Decision> {
        match &self.outcome {
            HopOutcome::Evaluated { decision } => Some(*decision),
            HopOutcome::Inconclusive { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.decision().map(|d| d.is_positive()).unwrap_or(false)
    }

    pub fn applied_delta(&self) -> f64 {
        self.confidence_after - self.confidence_before
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub entity_id: String,
    /// Final hypothesis pool, evolved children included.
    pub hypotheses: Vec<Hypothesis>,
    pub executions: Vec<HopExecution>,
    /// Ids of hypotheses spawned by evolution during this pass.
    pub evolved: Vec<String>,
    /// Evidence gathered by evaluated hops, as new immutable episodes.
    pub episodes: Vec<Episode>,
    pub iterations: u32,
    pub stop_reason: StopReason,
}

impl DiscoveryResult {
    /// Hops that reached the evaluator.
    pub fn evaluated(&self) -> impl Iterator<Item = &HopExecution> {
        self.executions.iter().filter(|e| e.decision().is_some())
    }

    pub fn usage(&self) -> u64 {
        self.evaluated().count() as u64
    }

    pub fn successes(&self) -> u64 {
        self.evaluated().filter(|e| e.is_success()).count() as u64
    }

    pub fn net_confidence_change(&self) -> f64 {
        self.evaluated().map(|e| e.applied_delta()).sum()
    }

    pub fn top_hypothesis(&self) -> Option<&Hypothesis> {
        self.hypotheses.iter().max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.id.cmp(&a.id))
        })
    }
}

/// Per-pass knobs beyond the hypothesis pool.
#[derive(Debug, Clone, Default)]
pub struct PassOptions {
    pub max_iterations: u32,
    pub target_confidence: f64,
    /// The binding's learned per-channel counters.
    pub channel_stats: BTreeMap<String, ChannelStats>,
    /// Only follow shortcut channels (trusted binding re-run).
    pub shortcuts_only: bool,
    pub cancel: CancelToken,
}

pub struct Orchestrator {
    config: Arc<EngineConfig>,
    fetcher: Arc<dyn ContentFetcher>,
    evaluator: Arc<dyn EvidenceEvaluator>,
    evolution: EvolutionRules,
    capabilities: CapabilityMap,
}

/// Chosen next hop for a hypothesis.
struct HopChoice {
    hop_type: String,
    score: f64,
    via_shortcut: bool,
}

impl Orchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        fetcher: Arc<dyn ContentFetcher>,
        evaluator: Arc<dyn EvidenceEvaluator>,
    ) -> Result<Self, crate::error::DiscoveryError> {
        let evolution = EvolutionRules::from_config(&config.discovery)?;
        let capabilities = CapabilityMap::from_config(&config.capabilities);
        Ok(Self {
            config,
            fetcher,
            evaluator,
            evolution,
            capabilities,
        })
    }

    fn discovery(&self) -> &DiscoveryConfig {
        &self.config.discovery
    }

    /// Run a pass with configured target confidence and no learned channel stats.
    pub async fn run(
        &self,
        entity: &Entity,
        hypotheses: Vec<Hypothesis>,
        max_iterations: u32,
    ) -> DiscoveryResult {
        let options = PassOptions {
            max_iterations,
            target_confidence: self.discovery().target_confidence,
            ..PassOptions::default()
        };
        self.run_with(entity, hypotheses, &options).await
    }

    pub async fn run_with(
        &self,
        entity: &Entity,
        hypotheses: Vec<Hypothesis>,
        options: &PassOptions,
    ) -> DiscoveryResult {
        let mut pool = hypotheses;
        for h in pool.iter_mut() {
            h.confidence = clamp_unit(h.confidence);
        }
        let mut tried: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut executions: Vec<HopExecution> = Vec::new();
        let mut episodes: Vec<Episode> = Vec::new();
        let mut evolved: Vec<String> = Vec::new();
        let mut iterations = 0u32;

        let stop_reason = loop {
            // Checked ahead of the iteration cap so a hop that lands the
            // target on the last allowed iteration still reports it.
            if let Some(top) = top_hypothesis(&pool) {
                if top.confidence >= options.target_confidence {
                    log::info!(
                        "Orchestrator: {} at target on {} ({:.2}) after {} iterations",
                        entity.id,
                        top.category,
                        top.confidence,
                        iterations
                    );
                    break StopReason::TargetReached;
                }
            }
            if iterations >= options.max_iterations {
                break StopReason::MaxIterations;
            }
            if options.cancel.is_cancelled() {
                log::info!("Orchestrator: {} cancelled after {} iterations", entity.id, iterations);
                break StopReason::Cancelled;
            }

            // SELECT_HYPOTHESIS
            let Some((idx, eig, hop)) = self.select(&pool, &tried, options) else {
                break StopReason::Exhausted;
            };
            iterations += 1;

            let hypothesis = pool[idx].clone();
            tried
                .entry(hypothesis.id.clone())
                .or_default()
                .insert(hop.hop_type.clone());

            log::debug!(
                "Orchestrator: {} iter {} -> {} via {} (eig {:.3}, hop score {:.3}{})",
                entity.id,
                iterations,
                hypothesis.category,
                hop.hop_type,
                eig,
                hop.score,
                if hop.via_shortcut { ", shortcut" } else { "" }
            );

            // FETCH + EVALUATE
            let before = hypothesis.confidence;
            let mut execution = HopExecution {
                iteration: iterations,
                hypothesis_id: hypothesis.id.clone(),
                category: hypothesis.category.clone(),
                hop_type: hop.hop_type.clone(),
                hop_score: hop.score,
                via_shortcut: hop.via_shortcut,
                outcome: HopOutcome::Inconclusive {
                    reason: String::new(),
                },
                confidence_before: before,
                confidence_after: before,
                rationale: String::new(),
            };

            let (content, evaluation) = match self.gather(entity, &hypothesis, &hop.hop_type).await {
                Ok(pair) => pair,
                Err(reason) => {
                    log::info!(
                        "Orchestrator: {} hop {} for {} inconclusive: {}",
                        entity.id,
                        hop.hop_type,
                        hypothesis.category,
                        reason
                    );
                    execution.outcome = HopOutcome::Inconclusive { reason };
                    executions.push(execution);
                    continue;
                }
            };

            // UPDATE_CONFIDENCE
            let delta = self.resolve_delta(&evaluation);
            let after = clamp_unit(before + delta);
            {
                let target = &mut pool[idx];
                target.confidence = after;
                target.evidence_count = target.evidence_count.saturating_add(1);
            }
            execution.outcome = HopOutcome::Evaluated {
                decision: evaluation.decision,
            };
            execution.confidence_after = after;
            execution.rationale = evaluation.rationale.clone();
            executions.push(execution);
            episodes.push(evidence_episode(entity, &hop.hop_type, &content));

            // Evolution
            if evaluation.decision == Decision::Accept {
                let spawned = self.evolution.evolve(&pool[idx], &evaluation.rationale, &pool);
                if let Some(mut child) = spawned {
                    if let Some(capability) = self.capabilities.resolve(&child.category).capability() {
                        child.mapped_capability = Some(capability.to_string());
                    }
                    evolved.push(child.id.clone());
                    pool.push(child);
                }
            }
        };

        log::info!(
            "Orchestrator: {} pass done: {} iterations, {} evaluated, stop={:?}",
            entity.id,
            iterations,
            executions.iter().filter(|e| e.decision().is_some()).count(),
            stop_reason
        );

        DiscoveryResult {
            entity_id: entity.id.clone(),
            hypotheses: pool,
            executions,
            evolved,
            episodes,
            iterations,
            stop_reason,
        }
    }

    /// Highest-EIG hypothesis with a hop left, and that hop.
    fn select(
        &self,
        pool: &[Hypothesis],
        tried: &HashMap<String, BTreeSet<String>>,
        options: &PassOptions,
    ) -> Option<(usize, f64, HopChoice)> {
        let eig = EigPrioritizer::new(&self.config);
        for (idx, score) in eig.rank(pool) {
            let hypothesis = &pool[idx];
            if self.is_saturated(hypothesis.confidence) {
                continue;
            }
            let empty = BTreeSet::new();
            let tried_here = tried.get(&hypothesis.id).unwrap_or(&empty);
            if let Some(hop) = self.select_hop(hypothesis, score, tried_here, options) {
                return Some((idx, score, hop));
            }
        }
        None
    }

    fn is_saturated(&self, confidence: f64) -> bool {
        let margin = self.discovery().saturation_margin;
        confidence <= margin || confidence >= 1.0 - margin
    }

    /// `hop_score = channel_ROI × EIG`, over channels not yet tried for this
    /// hypothesis in this pass. For the first `shortcut_attempts` hops of a
    /// hypothesis that carries shortcuts, the next untried shortcut is taken
    /// in cluster order with a boosted ROI.
    fn select_hop(
        &self,
        hypothesis: &Hypothesis,
        eig: f64,
        tried: &BTreeSet<String>,
        options: &PassOptions,
    ) -> Option<HopChoice> {
        let discovery = self.discovery();
        let roi_for = |channel: &str| {
            let reliability =
                channel_reliability(options.channel_stats.get(channel), discovery.channel_exploration);
            effective_roi(self.config.base_channel_roi(channel), reliability)
        };

        let in_shortcut_phase = (tried.len() as u32) < discovery.shortcut_attempts;
        if options.shortcuts_only || in_shortcut_phase {
            if let Some(channel) = hypothesis
                .shortcut_channels
                .iter()
                .find(|c| !tried.contains(c.as_str()))
            {
                return Some(HopChoice {
                    hop_type: channel.clone(),
                    score: roi_for(channel) * discovery.shortcut_boost * eig,
                    via_shortcut: true,
                });
            }
        }
        if options.shortcuts_only {
            return None;
        }

        let mut candidates: Vec<&String> = hypothesis
            .channels
            .iter()
            .chain(hypothesis.shortcut_channels.iter())
            .collect();
        if candidates.is_empty() {
            candidates = discovery.default_channels.iter().collect();
        }
        candidates.sort();
        candidates.dedup();

        let mut best: Option<HopChoice> = None;
        for channel in candidates {
            if tried.contains(channel.as_str()) {
                continue;
            }
            let score = roi_for(channel) * eig;
            if best.as_ref().map(|b| score > b.score).unwrap_or(true) {
                best = Some(HopChoice {
                    hop_type: channel.clone(),
                    score,
                    via_shortcut: false,
                });
            }
        }
        best
    }

    /// FETCH then EVALUATE, each retried on transient errors.
    async fn gather(
        &self,
        entity: &Entity,
        hypothesis: &Hypothesis,
        hop_type: &str,
    ) -> Result<(FetchedContent, Evaluation), String> {
        let retry = &self.config.retry;
        let query = build_query(&entity.name, hypothesis);

        let content = with_backoff(retry, "fetch", |e: &crate::external::FetchError| e.is_transient(), || {
            self.fetcher.fetch(&query, hop_type)
        })
        .await
        .map_err(|e| format!("fetch failed: {}", e))?;

        let evaluation = with_backoff(
            retry,
            "evaluate",
            |e: &crate::external::EvaluateError| e.is_transient(),
            || self.evaluator.evaluate(&content, hypothesis, hop_type),
        )
        .await
        .map_err(|e| format!("evaluation failed: {}", e))?;

        Ok((content, evaluation))
    }

    /// Confidence delta for a decision. Constants by default; with
    /// `use_evaluator_delta` the evaluator's delta is used when its sign agrees
    /// with the decision, bounded by `max_evaluator_delta`.
    fn resolve_delta(&self, evaluation: &Evaluation) -> f64 {
        let discovery = self.discovery();
        let constant = match evaluation.decision {
            Decision::Accept => discovery.deltas.accept,
            Decision::WeakAccept => discovery.deltas.weak_accept,
            Decision::Reject => discovery.deltas.reject,
        };
        if !discovery.use_evaluator_delta {
            return constant;
        }
        let delta = evaluation.confidence_delta;
        let agrees = match evaluation.decision {
            Decision::Accept | Decision::WeakAccept => delta >= 0.0,
            Decision::Reject => delta <= 0.0,
        };
        if !delta.is_finite() || !agrees {
            log::warn!(
                "Orchestrator: evaluator delta {} disagrees with {}, using {}",
                delta,
                evaluation.decision,
                constant
            );
            return constant;
        }
        let bound = discovery.max_evaluator_delta.abs();
        delta.clamp(-bound, bound)
    }
}

fn top_hypothesis(pool: &[Hypothesis]) -> Option<&Hypothesis> {
    pool.iter().max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

fn evidence_episode(entity: &Entity, hop_type: &str, content: &FetchedContent) -> Episode {
    let timestamp = Utc::now();
    Episode {
        id: episode_id(&entity.id, &content.source_url, &timestamp, &content.text),
        entity_id: entity.id.clone(),
        hop_type: hop_type.to_string(),
        source_url: content.source_url.clone(),
        timestamp,
        raw_text: content.text.clone(),
        embedding: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{EvaluateError, FetchError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Returns canned text per hop type; hop types listed in `down` always time out.
    struct FakeFetcher {
        down: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn new(down: &[&str]) -> Self {
            Self {
                down: down.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ContentFetcher for FakeFetcher {
        async fn fetch(&self, query: &str, hop_type: &str) -> Result<FetchedContent, FetchError> {
            self.calls.lock().push(hop_type.to_string());
            if self.down.iter().any(|d| d == hop_type) {
                return Err(FetchError::Timeout(10));
            }
            Ok(FetchedContent {
                text: format!("{query} via {hop_type}"),
                source_url: format!("https://{hop_type}.example/{}", query.replace(' ', "-")),
            })
        }
    }

    /// Plays back scripted evaluations in order, then rejects.
    struct ScriptedEvaluator {
        script: Mutex<VecDeque<Evaluation>>,
    }

    impl ScriptedEvaluator {
        fn new(script: Vec<(Decision, &str)>) -> Self {
            Self {
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|(decision, rationale)| Evaluation {
                            decision,
                            confidence_delta: 0.0,
                            rationale: rationale.to_string(),
                        })
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl EvidenceEvaluator for ScriptedEvaluator {
        async fn evaluate(
            &self,
            _content: &FetchedContent,
            _hypothesis: &Hypothesis,
            _hop_type: &str,
        ) -> Result<Evaluation, EvaluateError> {
            Ok(self.script.lock().pop_front().unwrap_or(Evaluation {
                decision: Decision::Reject,
                confidence_delta: -0.08,
                rationale: "nothing relevant".into(),
            }))
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config
    }

    fn crm(confidence: f64, channels: &[&str], shortcuts: &[&str]) -> Hypothesis {
        Hypothesis {
            id: "hyp-crm".into(),
            entity_id: "acme".into(),
            category: "CRM".into(),
            confidence,
            derived_from: None,
            mapped_capability: Some("CRM".into()),
            channels: channels.iter().map(|s| s.to_string()).collect(),
            shortcut_channels: shortcuts.iter().map(|s| s.to_string()).collect(),
            evidence_count: 0,
            depth: 0,
        }
    }

    fn orchestrator(
        config: EngineConfig,
        fetcher: Arc<FakeFetcher>,
        evaluator: ScriptedEvaluator,
    ) -> Orchestrator {
        Orchestrator::new(Arc::new(config), fetcher, Arc::new(evaluator)).expect("orchestrator")
    }

    #[tokio::test]
    async fn test_single_accept_on_jobs_board() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let orch = orchestrator(
            fast_config(),
            fetcher.clone(),
            ScriptedEvaluator::new(vec![(Decision::Accept, "CRM admin role posted")]),
        );
        let entity = Entity::new("acme", "Acme");
        let result = orch.run(&entity, vec![crm(0.5, &["jobs_board"], &[])], 1).await;

        assert_eq!(result.stop_reason, StopReason::MaxIterations);
        assert_eq!(result.executions.len(), 1);
        assert_eq!(result.executions[0].hop_type, "jobs_board");
        assert!((result.hypotheses[0].confidence - 0.6).abs() < 1e-9);
        assert_eq!(result.usage(), 1);
        assert_eq!(result.successes(), 1);
        assert_eq!(result.episodes.len(), 1);
        assert_eq!(result.episodes[0].hop_type, "jobs_board");
    }

    #[tokio::test]
    async fn test_highest_roi_channel_first() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let orch = orchestrator(fast_config(), fetcher.clone(), ScriptedEvaluator::new(vec![]));
        let entity = Entity::new("acme", "Acme");
        let result = orch
            .run(&entity, vec![crm(0.5, &["social", "news", "procurement_portal"], &[])], 3)
            .await;
        let order: Vec<&str> = result.executions.iter().map(|e| e.hop_type.as_str()).collect();
        assert_eq!(order, vec!["procurement_portal", "news", "social"]);
    }

    #[tokio::test]
    async fn test_shortcuts_skip_blind_exploration() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let orch = orchestrator(fast_config(), fetcher.clone(), ScriptedEvaluator::new(vec![]));
        let entity = Entity::new("beta", "Beta");
        let result = orch
            .run(
                &entity,
                vec![crm(0.5, &["procurement_portal", "jobs_board"], &["news"])],
                2,
            )
            .await;
        assert_eq!(result.executions[0].hop_type, "news");
        assert!(result.executions[0].via_shortcut);
        assert!(!result.executions[1].via_shortcut);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_inconclusive_and_pass_continues() {
        let fetcher = Arc::new(FakeFetcher::new(&["procurement_portal"]));
        let orch = orchestrator(
            fast_config(),
            fetcher.clone(),
            ScriptedEvaluator::new(vec![(Decision::WeakAccept, "maybe")]),
        );
        let entity = Entity::new("acme", "Acme");
        let result = orch
            .run(&entity, vec![crm(0.5, &["procurement_portal", "jobs_board"], &[])], 5)
            .await;

        let first = &result.executions[0];
        assert_eq!(first.hop_type, "procurement_portal");
        assert!(matches!(first.outcome, HopOutcome::Inconclusive { .. }));
        assert_eq!(first.confidence_after, first.confidence_before);
        assert_eq!(
            fetcher.calls.lock().iter().filter(|c| *c == "procurement_portal").count(),
            3,
            "transient failure retried up to max_attempts"
        );
        assert_eq!(result.executions[1].hop_type, "jobs_board");
        assert!((result.hypotheses[0].confidence - 0.55).abs() < 1e-9);
        assert_eq!(result.usage(), 1);
        assert_eq!(result.stop_reason, StopReason::Exhausted);
    }

    #[tokio::test]
    async fn test_target_confidence_stops_early() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let orch = orchestrator(
            fast_config(),
            fetcher,
            ScriptedEvaluator::new(vec![(Decision::Accept, "strong"), (Decision::Accept, "strong")]),
        );
        let entity = Entity::new("acme", "Acme");
        let result = orch
            .run(&entity, vec![crm(0.7, &["jobs_board", "news", "company_site"], &[])], 10)
            .await;
        assert_eq!(result.stop_reason, StopReason::TargetReached);
        assert_eq!(result.iterations, 2);
        assert!(result.hypotheses[0].confidence >= 0.85);
    }

    #[tokio::test]
    async fn test_pool_already_at_target_runs_no_hops() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let orch = orchestrator(fast_config(), fetcher.clone(), ScriptedEvaluator::new(vec![]));
        let mut erp = crm(0.3, &["jobs_board", "news"], &[]);
        erp.id = "hyp-erp".into();
        erp.category = "ERP".into();
        let options = PassOptions {
            max_iterations: 5,
            target_confidence: 0.85,
            ..PassOptions::default()
        };
        let entity = Entity::new("acme", "Acme");
        let result = orch
            .run_with(&entity, vec![crm(0.9, &["jobs_board", "news"], &[]), erp], &options)
            .await;

        assert_eq!(result.stop_reason, StopReason::TargetReached);
        assert_eq!(result.iterations, 0);
        assert!(fetcher.calls.lock().is_empty());
        assert!((result.hypotheses[0].confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_target_on_last_allowed_iteration_is_reported() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let orch = orchestrator(
            fast_config(),
            fetcher,
            ScriptedEvaluator::new(vec![(Decision::Accept, "strong")]),
        );
        let entity = Entity::new("acme", "Acme");
        let result = orch.run(&entity, vec![crm(0.8, &["jobs_board"], &[])], 1).await;
        assert_eq!(result.stop_reason, StopReason::TargetReached);
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn test_accept_with_trigger_evolves_child() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let orch = orchestrator(
            fast_config(),
            fetcher,
            ScriptedEvaluator::new(vec![(Decision::Accept, "They are migrating off Siebel")]),
        );
        let entity = Entity::new("acme", "Acme");
        let result = orch.run(&entity, vec![crm(0.5, &["jobs_board"], &[])], 1).await;
        assert_eq!(result.evolved.len(), 1);
        let child = result
            .hypotheses
            .iter()
            .find(|h| h.id == result.evolved[0])
            .expect("child in pool");
        assert_eq!(child.category, "CRM_migration");
        assert_eq!(child.derived_from.as_deref(), Some("hyp-crm"));
        assert_eq!(child.mapped_capability.as_deref(), Some("CRM_migration"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_iteration() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let orch = orchestrator(fast_config(), fetcher.clone(), ScriptedEvaluator::new(vec![]));
        let options = PassOptions {
            max_iterations: 5,
            target_confidence: 0.85,
            cancel: CancelToken::new(),
            ..PassOptions::default()
        };
        options.cancel.cancel();
        let entity = Entity::new("acme", "Acme");
        let result = orch.run_with(&entity, vec![crm(0.5, &["news"], &[])], &options).await;
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert!(fetcher.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shortcuts_only_limits_channels() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let orch = orchestrator(fast_config(), fetcher, ScriptedEvaluator::new(vec![]));
        let options = PassOptions {
            max_iterations: 5,
            target_confidence: 0.85,
            shortcuts_only: true,
            ..PassOptions::default()
        };
        let entity = Entity::new("acme", "Acme");
        let result = orch
            .run_with(&entity, vec![crm(0.5, &["news", "social"], &["jobs_board"])], &options)
            .await;
        assert_eq!(result.executions.len(), 1);
        assert_eq!(result.stop_reason, StopReason::Exhausted);
    }

    #[test]
    fn test_evaluator_delta_sign_checked() {
        let mut config = fast_config();
        config.discovery.use_evaluator_delta = true;
        let orch = orchestrator(config, Arc::new(FakeFetcher::new(&[])), ScriptedEvaluator::new(vec![]));
        let eval = |decision, delta| Evaluation {
            decision,
            confidence_delta: delta,
            rationale: String::new(),
        };
        assert!((orch.resolve_delta(&eval(Decision::Accept, 0.2)) - 0.2).abs() < 1e-9);
        assert!((orch.resolve_delta(&eval(Decision::Accept, 0.9)) - 0.25).abs() < 1e-9);
        assert!((orch.resolve_delta(&eval(Decision::Accept, -0.1)) - 0.10).abs() < 1e-9);
        assert!((orch.resolve_delta(&eval(Decision::Reject, f64::NAN)) + 0.08).abs() < 1e-9);
    }
}
