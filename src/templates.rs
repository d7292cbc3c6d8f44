//! Template discovery, validation, and publishing.
//!
//! Offline batch: sample a cluster's entities, keep the signal categories that
//! enough of them show, probe the draft against live evidence, and publish it
//! as a new immutable version only when the probe hit rate clears the bar.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::config::{EngineConfig, TemplateConfig};
use crate::entity::Entity;
use crate::error::DiscoveryError;
use crate::external::{build_query, ContentFetcher, EvaluateError, EvidenceEvaluator, FetchError};
use crate::retry::with_backoff;
use crate::store::{PersistentStore, StoreError};
use crate::types::{clamp_unit, Hypothesis, SignalPattern, Template, ValidationMetadata};

/// What one sampled entity showed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySample {
    pub entity_id: String,
    /// Best confidence per category at or above the accept threshold.
    pub categories: BTreeMap<String, f64>,
    /// Success rate per channel the entity's binding has used.
    pub channel_success: BTreeMap<String, f64>,
}

impl EntitySample {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.channel_success.is_empty()
    }
}

/// Build samples for every entity in the cluster that has shown anything.
pub fn samples_from_store(
    store: &dyn PersistentStore,
    cluster_id: &str,
    accept_threshold: f64,
) -> Result<Vec<EntitySample>, StoreError> {
    let mut samples = Vec::new();
    for entity in store.entities_in_cluster(cluster_id)? {
        let mut sample = EntitySample {
            entity_id: entity.id.clone(),
            ..EntitySample::default()
        };
        for h in store.hypotheses_for_entity(&entity.id)? {
            if h.confidence < accept_threshold {
                continue;
            }
            let best = sample.categories.entry(h.category.clone()).or_insert(0.0);
            *best = best.max(h.confidence);
        }
        if let Some(binding) = store.get_binding(&entity.id)? {
            for (channel, stats) in &binding.discovered_channels {
                if stats.attempts > 0 {
                    sample.channel_success.insert(channel.clone(), stats.success_rate());
                }
            }
        }
        if !sample.is_empty() {
            samples.push(sample);
        }
    }
    Ok(samples)
}

/// Draft a template from samples. `None` when nothing clears `min_support`.
pub fn derive(
    cluster_id: &str,
    samples: &[EntitySample],
    config: &TemplateConfig,
    previous: Option<&Template>,
) -> Option<Template> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len();

    let mut observed: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for sample in samples {
        for (category, confidence) in &sample.categories {
            observed.entry(category.as_str()).or_default().push(*confidence);
        }
    }

    let mut patterns: Vec<(f64, SignalPattern)> = observed
        .into_iter()
        .filter_map(|(category, values)| {
            let support = values.len() as f64 / n as f64;
            if support < config.min_support {
                return None;
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            Some((
                support,
                SignalPattern {
                    category: category.to_string(),
                    confidence: clamp_unit(mean),
                    description: format!("seen in {}/{} sampled entities", values.len(), n),
                },
            ))
        })
        .collect();
    if patterns.is_empty() {
        log::info!(
            "Templates: {} has no category above support {:.2} across {} samples",
            cluster_id,
            config.min_support,
            n
        );
        return None;
    }
    patterns.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.category.cmp(&b.1.category))
    });

    let mut channel_rates: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for sample in samples {
        for (channel, rate) in &sample.channel_success {
            let entry = channel_rates.entry(channel.as_str()).or_insert((0.0, 0));
            entry.0 += rate;
            entry.1 += 1;
        }
    }
    let mut channels: Vec<(&str, f64)> = channel_rates
        .into_iter()
        .map(|(c, (sum, count))| (c, sum / count as f64))
        .collect();
    channels.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    let confidence_score =
        patterns.iter().map(|(support, _)| support).sum::<f64>() / patterns.len() as f64;
    let version = previous.map(|t| t.version + 1).unwrap_or(1);

    Some(Template {
        id: format!("tpl-{}-v{}", cluster_id, version),
        cluster_id: cluster_id.to_string(),
        version,
        signal_patterns: patterns.into_iter().map(|(_, p)| p).collect(),
        channels: channels.into_iter().map(|(c, _)| c.to_string()).collect(),
        confidence_score: clamp_unit(confidence_score),
        validation_metadata: None,
    })
}

/// Probe the template's strongest pattern on up to `validation_probe_limit`
/// entities. A probe hits when the evaluator returns ACCEPT or WEAK_ACCEPT;
/// probes that fail to fetch or evaluate are inconclusive and excluded from
/// the hit rate.
pub async fn validate(
    template: &Template,
    probes: &[Entity],
    fetcher: &dyn ContentFetcher,
    evaluator: &dyn EvidenceEvaluator,
    config: &EngineConfig,
) -> ValidationMetadata {
    let limit = config.templates.validation_probe_limit;
    let strongest = template.signal_patterns.iter().max_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let channel = template
        .channels
        .first()
        .or_else(|| config.discovery.default_channels.first())
        .cloned()
        .unwrap_or_else(|| "news".to_string());

    let mut probed = 0u32;
    let mut hits = 0u32;
    let mut inconclusive = 0u32;

    if let Some(pattern) = strongest {
        for entity in probes.iter().take(limit) {
            probed += 1;
            let hypothesis = Hypothesis {
                id: format!("probe-{}-{}", template.id, entity.id),
                entity_id: entity.id.clone(),
                category: pattern.category.clone(),
                confidence: pattern.confidence,
                derived_from: None,
                mapped_capability: None,
                channels: vec![channel.clone()],
                shortcut_channels: Vec::new(),
                evidence_count: 0,
                depth: 0,
            };
            let query = build_query(&entity.name, &hypothesis);
            let fetched = with_backoff(&config.retry, "template probe fetch", FetchError::is_transient, || {
                fetcher.fetch(&query, &channel)
            })
            .await;
            let content = match fetched {
                Ok(content) => content,
                Err(e) => {
                    log::debug!("Templates: probe {} fetch failed: {}", entity.id, e);
                    inconclusive += 1;
                    continue;
                }
            };
            let evaluated = with_backoff(
                &config.retry,
                "template probe evaluate",
                EvaluateError::is_transient,
                || evaluator.evaluate(&content, &hypothesis, &channel),
            )
            .await;
            match evaluated {
                Ok(evaluation) if evaluation.decision.is_positive() => hits += 1,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Templates: probe {} evaluation failed: {}", entity.id, e);
                    inconclusive += 1;
                }
            }
        }
    }

    let conclusive = probed - inconclusive;
    let hit_rate = if conclusive == 0 {
        0.0
    } else {
        hits as f64 / conclusive as f64
    };
    let passed = conclusive > 0 && hit_rate >= config.templates.min_validation_hit_rate;
    log::info!(
        "Templates: {} validation {}/{} hits ({} inconclusive), passed={}",
        template.id,
        hits,
        conclusive,
        inconclusive,
        passed
    );
    ValidationMetadata {
        probes: probed,
        hits,
        inconclusive,
        hit_rate,
        passed,
        validated_at: Utc::now(),
        sample_size: probes.len().min(limit),
    }
}

/// Publish a validated template. Unvalidated or failing drafts are refused.
pub fn publish(store: &dyn PersistentStore, template: &Template) -> Result<(), DiscoveryError> {
    match &template.validation_metadata {
        Some(meta) if meta.passed => {}
        _ => {
            return Err(DiscoveryError::Store(StoreError::Invariant(format!(
                "template {} has not passed validation",
                template.id
            ))))
        }
    }
    store.publish_template(template)?;
    log::info!(
        "Templates: published {} ({} patterns, {} channels)",
        template.id,
        template.signal_patterns.len(),
        template.channels.len()
    );
    Ok(())
}
