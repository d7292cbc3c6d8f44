//! Hypothesis Generator.
//!
//! Produces one hypothesis per need category that maps onto a capability.
//! Needs come from the cluster template's signal patterns and from needs the
//! entity declared in its metadata. Starting confidence is the template's
//! per-category confidence (or `default_prior_confidence` for declared-only
//! needs), discounted when the capability match is not direct. When the
//! cluster has learned discovery shortcuts, every hypothesis carries them so
//! the hop selector can skip blind exploration.

use sha2::{Digest, Sha256};

use crate::config::DiscoveryConfig;
use crate::entity::Entity;
use crate::types::{clamp_unit, ClusterIntelligence, Hypothesis, Template};

use super::capabilities::{CapabilityMap, CapabilityMatch};

/// Stable id for a hypothesis: same entity + category (+ parent) gives the same id.
pub fn hypothesis_id(entity_id: &str, category: &str, parent: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_id.as_bytes());
    hasher.update(b"|");
    hasher.update(category.to_lowercase().as_bytes());
    if let Some(parent) = parent {
        hasher.update(b"|");
        hasher.update(parent.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("hyp-{}", &digest[..12])
}

pub struct HypothesisGenerator {
    config: DiscoveryConfig,
    capabilities: CapabilityMap,
}

impl HypothesisGenerator {
    pub fn new(config: DiscoveryConfig, capabilities: CapabilityMap) -> Self {
        Self {
            config,
            capabilities,
        }
    }

    pub fn generate(
        &self,
        entity: &Entity,
        template: Option<&Template>,
        intel: Option<&ClusterIntelligence>,
    ) -> Vec<Hypothesis> {
        let shortcuts = shortcut_order(intel);
        let template_channels: Vec<String> = match template {
            Some(t) if !t.channels.is_empty() => t.channels.clone(),
            _ => self.config.default_channels.clone(),
        };

        let mut candidates: Vec<(String, f64)> = Vec::new();
        if let Some(template) = template {
            for pattern in &template.signal_patterns {
                candidates.push((pattern.category.clone(), pattern.confidence));
            }
        }
        for need in entity.declared_needs() {
            let known = template.and_then(|t| t.pattern_for(&need)).is_some();
            if !known {
                candidates.push((need, self.config.default_prior_confidence));
            }
        }

        let mut hypotheses: Vec<Hypothesis> = Vec::new();
        for (category, base_confidence) in candidates {
            if hypotheses
                .iter()
                .any(|h| h.category.eq_ignore_ascii_case(&category))
            {
                continue;
            }
            let matched = self.capabilities.resolve(&category);
            let confidence = match &matched {
                CapabilityMatch::Direct(_) => clamp_unit(base_confidence),
                CapabilityMatch::Fuzzy { .. } => {
                    clamp_unit(base_confidence - self.config.capability_discount)
                }
                CapabilityMatch::None => {
                    log::debug!(
                        "Generator: {} has no capability for {}, skipping",
                        entity.id,
                        category
                    );
                    continue;
                }
            };
            hypotheses.push(Hypothesis {
                id: hypothesis_id(&entity.id, &category, None),
                entity_id: entity.id.clone(),
                category,
                confidence,
                derived_from: None,
                mapped_capability: matched.capability().map(|c| c.to_string()),
                channels: template_channels.clone(),
                shortcut_channels: shortcuts.clone(),
                evidence_count: 0,
                depth: 0,
            });
        }

        log::debug!(
            "Generator: {} -> {} hypotheses ({} shortcut channels)",
            entity.id,
            hypotheses.len(),
            shortcuts.len()
        );
        hypotheses
    }
}

fn shortcut_order(intel: Option<&ClusterIntelligence>) -> Vec<String> {
    intel
        .map(|i| i.discovery_shortcuts.clone())
        .unwrap_or_default()
}

/// Fold freshly generated hypotheses into the stored set.
///
/// Stored hypotheses keep their learned confidence and evidence; their
/// channel and shortcut annotations are refreshed from the generated copy.
/// Stored hypotheses with no generated counterpart (evolved children,
/// categories dropped from a newer template) are kept as they are, with
/// the current shortcuts applied.
pub fn merge_with_prior(generated: Vec<Hypothesis>, prior: Vec<Hypothesis>) -> Vec<Hypothesis> {
    let shortcuts = generated
        .iter()
        .find(|h| !h.shortcut_channels.is_empty())
        .map(|h| h.shortcut_channels.clone());

    let mut merged: Vec<Hypothesis> = Vec::with_capacity(generated.len() + prior.len());
    let mut prior = prior;
    for fresh in generated {
        match prior.iter().position(|p| p.id == fresh.id) {
            Some(idx) => {
                let mut kept = prior.remove(idx);
                kept.channels = fresh.channels;
                kept.shortcut_channels = fresh.shortcut_channels;
                kept.mapped_capability = fresh.mapped_capability.or(kept.mapped_capability);
                merged.push(kept);
            }
            None => merged.push(fresh),
        }
    }
    for mut leftover in prior {
        if let Some(shortcuts) = &shortcuts {
            leftover.shortcut_channels = shortcuts.clone();
        }
        merged.push(leftover);
    }
    merged
}
