//! Discovery engine: the batch entry point.
//!
//! `run_discovery` drives one pass per entity of an entity or a cluster.
//! Entities run concurrently (bounded by `batch.maxConcurrency`); within an
//! entity everything is sequential. Each entity's pass holds that entity's
//! writer lock from the binding read to the binding write, so two passes
//! never interleave updates to the same binding. Cluster intelligence is
//! read-merge-written under a per-cluster lock on promotion and demotion.
//!
//! A failure is scoped to its entity and reported; the batch carries on.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::checkpoint::{self, Checkpoint, CheckpointSource};
use crate::cluster_intel::ClusterAggregator;
use crate::config::EngineConfig;
use crate::discovery::eig::seed_evidence;
use crate::discovery::{
    merge_with_prior, CancelToken, CapabilityMap, HypothesisGenerator, Orchestrator, PassOptions,
    StopReason,
};
use crate::embeddings::{select_strategy, EmbeddingStrategy};
use crate::error::{DiscoveryError, ReportedError};
use crate::episodes::{ingest_episodes, EpisodeClusterer, EpisodeRecord, IngestReport, IngestionQueue};
use crate::external::{ContentFetcher, EvidenceEvaluator};
use crate::lifecycle::{LifecycleManager, Transition};
use crate::queries::{self, Opportunity, OpportunityFilter};
use crate::store::{PersistentStore, StoreError};
use crate::templates;
use crate::types::{BindingState, ClusterIntelligence, ClusteredTimeline, RuntimeBinding, Template};

/// What a batch run covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Entity(String),
    Cluster(String),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Entity(id) => write!(f, "entity {}", id),
            Target::Cluster(id) => write!(f, "cluster {}", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_iterations: u32,
    pub target_confidence: f64,
    /// Skip entities already recorded in the checkpoint file.
    pub resume: bool,
    pub cancel: CancelToken,
}

impl RunOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_iterations: config.discovery.max_iterations,
            target_confidence: config.discovery.target_confidence,
            resume: true,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityOutcome {
    Completed {
        iterations: u32,
        evaluated: u64,
        successes: u64,
        evolved: usize,
        stop_reason: StopReason,
        state: BindingState,
        raw_episodes: usize,
        clustered_episodes: usize,
        compression_ratio: f64,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: ReportedError,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReport {
    pub entity_id: String,
    #[serde(flatten)]
    pub outcome: EntityOutcome,
}

impl EntityReport {
    fn skipped(entity_id: &str, reason: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            outcome: EntityOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    fn failed(entity_id: &str, err: &DiscoveryError) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            outcome: EntityOutcome::Failed {
                error: ReportedError::from(err),
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, EntityOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub run_id: String,
    pub target: Target,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Ordered by entity id.
    pub entities: Vec<EntityReport>,
    pub transitions: Vec<Transition>,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointSource>,
}

impl BatchReport {
    pub fn entity(&self, entity_id: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }

    pub fn completed(&self) -> usize {
        self.entities.iter().filter(|e| e.is_completed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| matches!(e.outcome, EntityOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| matches!(e.outcome, EntityOutcome::Failed { .. }))
            .count()
    }
}

/// Result of one entity's pass, before it is folded into the report.
struct PassRecord {
    outcome: EntityOutcome,
    transitions: Vec<Transition>,
    binding: Option<RuntimeBinding>,
}

impl PassRecord {
    fn skipped(reason: String) -> Self {
        Self {
            outcome: EntityOutcome::Skipped { reason },
            transitions: Vec::new(),
            binding: None,
        }
    }

    fn executed(&self) -> bool {
        matches!(self.outcome, EntityOutcome::Completed { evaluated, .. } if evaluated > 0)
    }
}

/// The checkpoint file of one batch, rewritten as entities complete.
struct CheckpointSink {
    path: PathBuf,
    checkpoint: Checkpoint,
}

impl CheckpointSink {
    fn record(&mut self, binding: &RuntimeBinding) {
        self.checkpoint.record(binding);
        if let Err(e) = checkpoint::save(&self.path, &self.checkpoint) {
            log::warn!(
                "Engine: checkpoint write for {} failed: {}",
                binding.entity_id,
                e
            );
        }
    }
}

/// Cheap to clone; clones share stores, locks, and the ingestion queue.
#[derive(Clone)]
pub struct DiscoveryEngine {
    config: Arc<EngineConfig>,
    store: Arc<dyn PersistentStore>,
    fetcher: Arc<dyn ContentFetcher>,
    evaluator: Arc<dyn EvidenceEvaluator>,
    orchestrator: Arc<Orchestrator>,
    generator: Arc<HypothesisGenerator>,
    lifecycle: Arc<LifecycleManager>,
    aggregator: Arc<ClusterAggregator>,
    clusterer: Arc<EpisodeClusterer>,
    queue: Arc<IngestionQueue>,
    entity_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cluster_locks: Arc<DashMap<String, Arc<parking_lot::Mutex<()>>>>,
}

impl DiscoveryEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PersistentStore>,
        fetcher: Arc<dyn ContentFetcher>,
        evaluator: Arc<dyn EvidenceEvaluator>,
    ) -> Result<Self, DiscoveryError> {
        let strategy = select_strategy(&config.clustering);
        Self::with_strategy(config, store, fetcher, evaluator, strategy)
    }

    /// Build with an explicit embedding strategy instead of the configured one.
    pub fn with_strategy(
        config: EngineConfig,
        store: Arc<dyn PersistentStore>,
        fetcher: Arc<dyn ContentFetcher>,
        evaluator: Arc<dyn EvidenceEvaluator>,
        strategy: Arc<dyn EmbeddingStrategy>,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;
        let config = Arc::new(config);
        let orchestrator = Orchestrator::new(config.clone(), fetcher.clone(), evaluator.clone())?;
        let generator = HypothesisGenerator::new(
            config.discovery.clone(),
            CapabilityMap::from_config(&config.capabilities),
        );
        let lifecycle = LifecycleManager::new(
            config.lifecycle.clone(),
            &config.aggregator,
            config.discovery.accept_threshold,
        );
        let aggregator = ClusterAggregator::new(config.aggregator.clone());
        let clusterer = EpisodeClusterer::new(config.clustering.clone(), strategy);
        log::info!(
            "Engine: ready (embeddings={}, concurrency={})",
            clusterer.strategy_name(),
            config.batch.max_concurrency
        );
        Ok(Self {
            config,
            store,
            fetcher,
            evaluator,
            orchestrator: Arc::new(orchestrator),
            generator: Arc::new(generator),
            lifecycle: Arc::new(lifecycle),
            aggregator: Arc::new(aggregator),
            clusterer: Arc::new(clusterer),
            queue: Arc::new(IngestionQueue::new()),
            entity_locks: Arc::new(DashMap::new()),
            cluster_locks: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub fn ingestion_queue(&self) -> &IngestionQueue {
        &self.queue
    }

    fn entity_lock(&self, entity_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.entity_locks
            .entry(entity_id.to_string())
            .or_default()
            .clone()
    }

    fn cluster_lock(&self, cluster_id: &str) -> Arc<parking_lot::Mutex<()>> {
        self.cluster_locks
            .entry(cluster_id.to_string())
            .or_default()
            .clone()
    }

    // -------------------------------------------------------------------------
    // Batch entry point
    // -------------------------------------------------------------------------

    pub async fn run_discovery(
        &self,
        target: Target,
        max_iterations: u32,
        target_confidence: f64,
    ) -> Result<BatchReport, DiscoveryError> {
        let options = RunOptions {
            max_iterations,
            target_confidence,
            ..RunOptions::from_config(&self.config)
        };
        self.run_discovery_with(target, &options).await
    }

    pub async fn run_discovery_with(
        &self,
        target: Target,
        options: &RunOptions,
    ) -> Result<BatchReport, DiscoveryError> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        let entity_ids: Vec<String> = match &target {
            Target::Entity(id) => {
                if self.store.get_entity(id)?.is_none() {
                    return Err(DiscoveryError::NotFound(format!("entity {}", id)));
                }
                vec![id.clone()]
            }
            Target::Cluster(cluster_id) => {
                let mut ids: Vec<String> = self
                    .store
                    .entities_in_cluster(cluster_id)?
                    .into_iter()
                    .map(|e| e.id)
                    .collect();
                ids.sort();
                ids
            }
        };
        log::info!(
            "Engine: run {} over {} ({} entities)",
            run_id,
            target,
            entity_ids.len()
        );

        let (mut sink, checkpoint_source) = self.open_checkpoint(options.resume);

        let semaphore = Arc::new(Semaphore::new(self.config.batch.max_concurrency));
        let mut tasks: JoinSet<(String, PassRecord)> = JoinSet::new();
        let mut in_flight: BTreeSet<String> = BTreeSet::new();
        let mut reports: Vec<EntityReport> = Vec::new();
        let mut transitions: Vec<Transition> = Vec::new();
        let mut executed: HashSet<String> = HashSet::new();
        let mut exempt: HashSet<String> = HashSet::new();

        for entity_id in entity_ids {
            if sink.as_ref().map(|s| s.checkpoint.contains(&entity_id)).unwrap_or(false) {
                log::debug!("Engine: {} already checkpointed, skipping", entity_id);
                reports.push(EntityReport::skipped(&entity_id, "completed in a previous run"));
                exempt.insert(entity_id);
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DiscoveryError::Io(format!("worker pool closed: {}", e)))?;
            if options.cancel.is_cancelled() {
                reports.push(EntityReport::skipped(&entity_id, "cancelled"));
                exempt.insert(entity_id);
                continue;
            }

            let engine = self.clone();
            let options = options.clone();
            in_flight.insert(entity_id.clone());
            tasks.spawn(async move {
                let _permit = permit;
                let record = match engine.run_entity(&entity_id, &options).await {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("Engine: {} failed: {}", entity_id, e);
                        PassRecord {
                            outcome: EntityOutcome::Failed {
                                error: ReportedError::from(&e),
                            },
                            transitions: Vec::new(),
                            binding: None,
                        }
                    }
                };
                (entity_id, record)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (entity_id, record) = match joined {
                Ok(done) => done,
                Err(e) => {
                    log::error!("Engine: discovery task did not finish: {}", e);
                    continue;
                }
            };
            in_flight.remove(&entity_id);
            if record.executed() {
                executed.insert(entity_id.clone());
            }
            let interrupted = matches!(
                record.outcome,
                EntityOutcome::Completed {
                    stop_reason: StopReason::Cancelled,
                    ..
                }
            );
            if interrupted {
                exempt.insert(entity_id.clone());
            }
            if let (Some(sink), Some(binding)) = (sink.as_mut(), &record.binding) {
                if !interrupted {
                    sink.record(binding);
                }
            }
            transitions.extend(record.transitions);
            reports.push(EntityReport {
                entity_id,
                outcome: record.outcome,
            });
        }
        for entity_id in in_flight {
            let err = DiscoveryError::Io("discovery task aborted".to_string());
            reports.push(EntityReport::failed(&entity_id, &err));
        }

        let cancelled = options.cancel.is_cancelled();
        if let Target::Cluster(cluster_id) = &target {
            if !cancelled {
                transitions.extend(self.maintenance_tick(cluster_id, &executed, &exempt).await);
            }
        }

        reports.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        let report = BatchReport {
            run_id,
            target,
            started_at,
            finished_at: Utc::now(),
            entities: reports,
            transitions,
            cancelled,
            checkpoint: checkpoint_source,
        };

        if let Some(sink) = &sink {
            if !report.cancelled && report.failed() == 0 {
                if let Err(e) = checkpoint::clear(&sink.path) {
                    log::warn!("Engine: could not clear checkpoint: {}", e);
                }
            }
        }
        log::info!(
            "Engine: run {} done: {} completed, {} skipped, {} failed, {} transitions{}",
            report.run_id,
            report.completed(),
            report.skipped(),
            report.failed(),
            report.transitions.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    fn open_checkpoint(&self, resume: bool) -> (Option<CheckpointSink>, Option<CheckpointSource>) {
        let Some(path) = self.config.batch.checkpoint_path.clone() else {
            return (None, None);
        };
        let (checkpoint, source) = if resume {
            match checkpoint::load(&path) {
                Ok(loaded) => (loaded.checkpoint, Some(loaded.source)),
                Err(e) => {
                    log::warn!("Engine: {}; starting without a checkpoint", e);
                    (Checkpoint::new(), None)
                }
            }
        } else {
            (Checkpoint::new(), None)
        };
        let sink = CheckpointSink { path, checkpoint };
        (Some(sink), source)
    }

    // -------------------------------------------------------------------------
    // One entity
    // -------------------------------------------------------------------------

    async fn run_entity(&self, entity_id: &str, options: &RunOptions) -> Result<PassRecord, DiscoveryError> {
        let lock = self.entity_lock(entity_id);
        let _writer = lock.lock().await;

        let entity = self
            .store
            .get_entity(entity_id)?
            .ok_or_else(|| DiscoveryError::NotFound(format!("entity {}", entity_id)))?;
        let mut binding = self
            .store
            .get_binding(entity_id)?
            .unwrap_or_else(|| RuntimeBinding::new(entity_id, None));
        if !LifecycleManager::accepts_executions(binding.state) {
            log::info!("Engine: {} is {}, no pass", entity_id, binding.state);
            return Ok(PassRecord::skipped(format!("binding is {}", binding.state)));
        }

        let (template, intel) = match entity.cluster_id.as_deref() {
            Some(cluster_id) => (
                self.store.latest_template(cluster_id)?,
                self.store.get_cluster_intel(cluster_id)?,
            ),
            None => (None, None),
        };

        let generated = self
            .generator
            .generate(&entity, template.as_ref(), intel.as_ref());
        let prior = self.store.hypotheses_for_entity(entity_id)?;
        let mut pool = merge_with_prior(generated, prior);

        // A trusted binding re-runs shortcuts (its own, else the cluster's)
        // instead of exploring.
        let trusted = binding.state == BindingState::Promoted;
        if trusted && !binding.discovery_shortcuts.is_empty() {
            for hypothesis in pool.iter_mut() {
                hypothesis.shortcut_channels = binding.discovery_shortcuts.clone();
            }
        }

        let episodes = self.store.episodes_for_entity(entity_id)?;
        let timeline = self.clusterer.compress(entity_id, &episodes);
        self.queue.drain_entity(entity_id);
        seed_evidence(&mut pool, &timeline);

        let pass = PassOptions {
            max_iterations: options.max_iterations,
            target_confidence: options.target_confidence,
            channel_stats: binding.discovered_channels.clone(),
            shortcuts_only: trusted,
            cancel: options.cancel.clone(),
        };
        let result = self.orchestrator.run_with(&entity, pool, &pass).await;

        match self.store.replace_hypotheses(entity_id, &result.hypotheses) {
            Ok(()) => {}
            Err(StoreError::Invariant(reason)) => {
                log::warn!("Engine: kept prior hypotheses for {}: {}", entity_id, reason);
            }
            Err(e) => return Err(e.into()),
        }
        for episode in &result.episodes {
            match self.store.append_episode(episode) {
                Ok(true) => {
                    self.queue.mark(entity_id, &episode.id);
                }
                Ok(false) => {}
                Err(StoreError::ImmutableRecord(reason)) => {
                    log::warn!("Engine: evidence episode {} not stored: {}", episode.id, reason);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if binding.template_id.is_none() {
            binding.template_id = template.as_ref().map(|t| t.id.clone());
        }
        let from = binding.state;
        self.lifecycle.record_executions(&mut binding, &result);
        let mut transitions = Vec::new();
        match self.lifecycle.evaluate(&mut binding) {
            Ok(Some(transition)) => transitions.push(transition),
            Ok(None) => {}
            Err(e) => log::warn!("Engine: {} transition refused: {}", entity_id, e),
        }
        self.store.upsert_binding(&binding)?;

        if let Some(cluster_id) = entity.cluster_id.as_deref() {
            self.sync_cluster_intel(cluster_id, from, &binding)?;
        }

        Ok(PassRecord {
            outcome: EntityOutcome::Completed {
                iterations: result.iterations,
                evaluated: result.usage(),
                successes: result.successes(),
                evolved: result.evolved.len(),
                stop_reason: result.stop_reason,
                state: binding.state,
                raw_episodes: timeline.raw_episode_count,
                clustered_episodes: timeline.episodes.len(),
                compression_ratio: timeline.compression_ratio(),
            },
            transitions,
            binding: Some(binding),
        })
    }

    /// Fold a promotion into, or a demotion out of, the cluster aggregate.
    fn sync_cluster_intel(
        &self,
        cluster_id: &str,
        from: BindingState,
        binding: &RuntimeBinding,
    ) -> Result<(), DiscoveryError> {
        let promoted = from != BindingState::Promoted && binding.state == BindingState::Promoted;
        let demoted = from == BindingState::Promoted && binding.state != BindingState::Promoted;
        if !promoted && !demoted {
            return Ok(());
        }

        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock();
        let mut intel = self
            .store
            .get_cluster_intel(cluster_id)?
            .unwrap_or_else(|| ClusterIntelligence::empty(cluster_id));
        let changed = if promoted {
            self.aggregator.add_binding(&mut intel, binding)
        } else {
            self.aggregator.remove_binding(&mut intel, &binding.entity_id)
        };
        if changed {
            self.store.upsert_cluster_intel(&intel)?;
        }
        Ok(())
    }

    /// Count an idle cycle for PROMOTED bindings in the cluster that saw no
    /// evaluated hop in this run, and apply any resulting transition.
    async fn maintenance_tick(
        &self,
        cluster_id: &str,
        executed: &HashSet<String>,
        exempt: &HashSet<String>,
    ) -> Vec<Transition> {
        let bindings = match self.store.bindings_in_cluster(cluster_id) {
            Ok(bindings) => bindings,
            Err(e) => {
                log::warn!("Engine: maintenance for {} skipped: {}", cluster_id, e);
                return Vec::new();
            }
        };

        let mut transitions = Vec::new();
        for snapshot in bindings {
            let entity_id = snapshot.entity_id.clone();
            if snapshot.state != BindingState::Promoted
                || executed.contains(&entity_id)
                || exempt.contains(&entity_id)
            {
                continue;
            }
            let lock = self.entity_lock(&entity_id);
            let _writer = lock.lock().await;
            match self.tick_binding(cluster_id, &entity_id) {
                Ok(Some(transition)) => transitions.push(transition),
                Ok(None) => {}
                Err(e) => log::warn!("Engine: maintenance of {} failed: {}", entity_id, e),
            }
        }
        transitions
    }

    fn tick_binding(&self, cluster_id: &str, entity_id: &str) -> Result<Option<Transition>, DiscoveryError> {
        let Some(mut binding) = self.store.get_binding(entity_id)? else {
            return Ok(None);
        };
        if binding.state != BindingState::Promoted {
            return Ok(None);
        }
        self.lifecycle.tick_idle(&mut binding);
        let transition = self.lifecycle.evaluate(&mut binding)?;
        self.store.upsert_binding(&binding)?;
        if transition.is_some() {
            self.sync_cluster_intel(cluster_id, BindingState::Promoted, &binding)?;
        }
        Ok(transition)
    }

    // -------------------------------------------------------------------------
    // Ingestion, compression, queries, templates
    // -------------------------------------------------------------------------

    /// Accept raw episode records for the next clustering pass.
    pub fn ingest(&self, records: Vec<EpisodeRecord>) -> Result<IngestReport, DiscoveryError> {
        ingest_episodes(
            self.store.as_ref(),
            &self.queue,
            records,
            self.config.clustering.embedding_dimension,
        )
    }

    /// Compressed timeline for an entity's stored episodes.
    pub fn compress_timeline(&self, entity_id: &str) -> Result<ClusteredTimeline, DiscoveryError> {
        let episodes = self.store.episodes_for_entity(entity_id)?;
        Ok(self.clusterer.compress(entity_id, &episodes))
    }

    pub fn top_opportunities(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>, DiscoveryError> {
        Ok(queries::top_opportunities(self.store.as_ref(), filter)?)
    }

    pub fn binding(&self, entity_id: &str) -> Result<Option<RuntimeBinding>, DiscoveryError> {
        Ok(self.store.get_binding(entity_id)?)
    }

    /// Recompute a cluster's intelligence from scratch and store it.
    pub fn rebuild_cluster_intel(&self, cluster_id: &str) -> Result<ClusterIntelligence, DiscoveryError> {
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock();
        let bindings = self.store.bindings_in_cluster(cluster_id)?;
        let intel = self.aggregator.rollup(cluster_id, &bindings);
        self.store.upsert_cluster_intel(&intel)?;
        Ok(intel)
    }

    /// Derive a new template version for the cluster, validate it against the
    /// cluster's own entities, and publish it if validation passes. Returns
    /// the draft with its validation metadata either way, or `None` when the
    /// cluster has nothing to derive from.
    pub async fn refresh_template(&self, cluster_id: &str) -> Result<Option<Template>, DiscoveryError> {
        let samples = templates::samples_from_store(
            self.store.as_ref(),
            cluster_id,
            self.config.discovery.accept_threshold,
        )?;
        let previous = self.store.latest_template(cluster_id)?;
        let Some(mut draft) =
            templates::derive(cluster_id, &samples, &self.config.templates, previous.as_ref())
        else {
            return Ok(None);
        };

        let probes = self.store.entities_in_cluster(cluster_id)?;
        let validation = templates::validate(
            &draft,
            &probes,
            self.fetcher.as_ref(),
            self.evaluator.as_ref(),
            &self.config,
        )
        .await;
        let passed = validation.passed;
        draft.validation_metadata = Some(validation);
        if passed {
            templates::publish(self.store.as_ref(), &draft)?;
        } else {
            log::info!("Engine: template {} failed validation, not published", draft.id);
        }
        Ok(Some(draft))
    }
}

/// Resolve a checkpoint path from config or the state directory.
pub fn default_checkpoint_path(config: &EngineConfig) -> Result<PathBuf, DiscoveryError> {
    match &config.batch.checkpoint_path {
        Some(path) => Ok(path.clone()),
        None => Ok(crate::config::state_dir()?.join("checkpoint.json")),
    }
}

/// Whether `path` holds a checkpoint (primary or fallback).
pub fn checkpoint_exists(path: &Path) -> bool {
    path.exists() || checkpoint::last_known_good_path(path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::external::{EvaluateError, Evaluation, FetchError, FetchedContent};
    use crate::store::MemoryStore;
    use crate::types::{Decision, Hypothesis, SignalPattern};
    use async_trait::async_trait;

    struct StaticFetcher;

    #[async_trait]
    impl ContentFetcher for StaticFetcher {
        async fn fetch(&self, query: &str, hop_type: &str) -> Result<FetchedContent, FetchError> {
            Ok(FetchedContent {
                text: format!("{query} on {hop_type}"),
                source_url: format!("https://{hop_type}.example/{}", query.replace(' ', "-")),
            })
        }
    }

    /// Same decision for every hop.
    struct FixedEvaluator(Decision);

    #[async_trait]
    impl EvidenceEvaluator for FixedEvaluator {
        async fn evaluate(
            &self,
            _content: &FetchedContent,
            _hypothesis: &Hypothesis,
            _hop_type: &str,
        ) -> Result<Evaluation, EvaluateError> {
            Ok(Evaluation {
                decision: self.0,
                confidence_delta: 0.0,
                rationale: "role posted".into(),
            })
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.clustering.embedding_dimension = 64;
        config
    }

    fn template(cluster: &str) -> Template {
        Template {
            id: format!("tpl-{cluster}-v1"),
            cluster_id: cluster.into(),
            version: 1,
            signal_patterns: vec![SignalPattern {
                category: "CRM".into(),
                confidence: 0.5,
                description: String::new(),
            }],
            channels: vec!["jobs_board".into(), "news".into(), "company_site".into()],
            confidence_score: 0.8,
            validation_metadata: None,
        }
    }

    fn engine(decision: Decision, store: Arc<MemoryStore>) -> DiscoveryEngine {
        DiscoveryEngine::new(
            fast_config(),
            store,
            Arc::new(StaticFetcher),
            Arc::new(FixedEvaluator(decision)),
        )
        .expect("engine")
    }

    fn seeded(entities: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in entities {
            store
                .upsert_entity(&Entity::new(id, id).with_cluster("fintech"))
                .expect("entity");
        }
        store.publish_template(&template("fintech")).expect("template");
        store
    }

    #[tokio::test]
    async fn test_entity_run_promotes_and_updates_cluster() {
        let store = seeded(&["acme"]);
        let engine = engine(Decision::Accept, store.clone());
        let report = engine
            .run_discovery(Target::Entity("acme".into()), 3, 0.95)
            .await
            .expect("run");

        assert_eq!(report.completed(), 1);
        let binding = store.get_binding("acme").expect("read").expect("binding");
        assert_eq!(binding.state, BindingState::Promoted);
        assert_eq!(binding.usage_count, 3);
        assert_eq!(report.transitions.len(), 1);
        assert_eq!(report.transitions[0].to, BindingState::Promoted);

        let intel = store.get_cluster_intel("fintech").expect("read").expect("intel");
        assert_eq!(intel.promoted_count(), 1);
        assert!(!intel.discovery_shortcuts.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_found() {
        let engine = engine(Decision::Accept, seeded(&[]));
        let err = engine
            .run_discovery(Target::Entity("ghost".into()), 3, 0.85)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_frozen_binding_is_skipped() {
        let store = seeded(&["acme"]);
        let mut binding = RuntimeBinding::new("acme", None);
        binding.state = BindingState::Frozen;
        store.upsert_binding(&binding).expect("binding");
        let engine = engine(Decision::Accept, store.clone());

        let report = engine
            .run_discovery(Target::Entity("acme".into()), 3, 0.85)
            .await
            .expect("run");
        assert_eq!(report.skipped(), 1);
        assert_eq!(store.get_binding("acme").expect("read"), Some(binding));
    }

    #[tokio::test]
    async fn test_rejections_keep_binding_exploring() {
        let store = seeded(&["acme"]);
        let engine = engine(Decision::Reject, store.clone());
        engine
            .run_discovery(Target::Entity("acme".into()), 3, 0.85)
            .await
            .expect("run");
        let binding = store.get_binding("acme").expect("read").expect("binding");
        assert_eq!(binding.state, BindingState::Exploring);
        assert_eq!(binding.success_count, 0);
        assert_eq!(binding.confidence_adjustment, 0.0);
        assert!(store.get_cluster_intel("fintech").expect("read").is_none());
    }

    #[tokio::test]
    async fn test_cluster_run_checkpoints_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        let mut config = fast_config();
        config.batch.checkpoint_path = Some(path.clone());
        let store = seeded(&["acme", "beta"]);
        let engine = DiscoveryEngine::new(
            config,
            store.clone(),
            Arc::new(StaticFetcher),
            Arc::new(FixedEvaluator(Decision::WeakAccept)),
        )
        .expect("engine");

        let report = engine
            .run_discovery(Target::Cluster("fintech".into()), 2, 0.95)
            .await
            .expect("run");
        assert_eq!(report.completed(), 2);
        assert!(!checkpoint_exists(&path), "completed run clears its checkpoint");
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_entities() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        let mut done = Checkpoint::new();
        done.record(&RuntimeBinding::new("acme", None));
        checkpoint::save(&path, &done).expect("save");

        let mut config = fast_config();
        config.batch.checkpoint_path = Some(path);
        let store = seeded(&["acme", "beta"]);
        let engine = DiscoveryEngine::new(
            config,
            store.clone(),
            Arc::new(StaticFetcher),
            Arc::new(FixedEvaluator(Decision::Accept)),
        )
        .expect("engine");

        let report = engine
            .run_discovery(Target::Cluster("fintech".into()), 2, 0.95)
            .await
            .expect("run");
        assert_eq!(report.checkpoint, Some(CheckpointSource::Primary));
        assert!(matches!(
            report.entity("acme").map(|e| &e.outcome),
            Some(EntityOutcome::Skipped { .. })
        ));
        assert!(report.entity("beta").map(|e| e.is_completed()).unwrap_or(false));
        assert!(store.get_binding("acme").expect("read").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_remaining() {
        let store = seeded(&["acme", "beta"]);
        let engine = engine(Decision::Accept, store);
        let options = RunOptions {
            max_iterations: 3,
            target_confidence: 0.85,
            resume: false,
            cancel: CancelToken::new(),
        };
        options.cancel.cancel();
        let report = engine
            .run_discovery_with(Target::Cluster("fintech".into()), &options)
            .await
            .expect("run");
        assert!(report.cancelled);
        assert_eq!(report.skipped(), 2);
    }

    #[tokio::test]
    async fn test_idle_promoted_binding_freezes_after_limit() {
        let store = seeded(&["acme", "beta"]);
        let mut promoted = RuntimeBinding::new("acme", None);
        promoted.state = BindingState::Promoted;
        promoted.usage_count = 4;
        promoted.success_count = 4;
        promoted.usage_at_promotion = 4;
        promoted.confidence_adjustment = 0.2;
        promoted.idle_cycles = 2;
        store.upsert_binding(&promoted).expect("binding");

        // acme has no shortcuts, so its trusted pass has nothing to run.
        let engine = engine(Decision::Reject, store.clone());
        let report = engine
            .run_discovery(Target::Cluster("fintech".into()), 2, 0.85)
            .await
            .expect("run");

        let acme = store.get_binding("acme").expect("read").expect("binding");
        assert_eq!(acme.state, BindingState::Frozen);
        assert!(report
            .transitions
            .iter()
            .any(|t| t.entity_id == "acme" && t.to == BindingState::Frozen));
    }

    #[test]
    fn test_ingest_marks_entity_dirty() {
        let store = seeded(&[]);
        let engine = engine(Decision::Accept, store.clone());
        let report = engine
            .ingest(vec![EpisodeRecord {
                id: None,
                entity_id: "newco".into(),
                hop_type: None,
                source_url: Some("https://news.example/newco".into()),
                timestamp: "2026-05-01T10:00:00Z".into(),
                raw_text: "Newco evaluating CRM vendors".into(),
                embedding: None,
            }])
            .expect("ingest");
        assert_eq!(report.accepted.len(), 1);
        assert!(engine.ingestion_queue().is_dirty("newco"));
        assert!(store.get_entity("newco").expect("read").is_some());
        let timeline = engine.compress_timeline("newco").expect("timeline");
        assert_eq!(timeline.raw_episode_count, 1);
    }
}
