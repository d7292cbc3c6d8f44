//! Cluster Intelligence Aggregator.
//!
//! Rolls up PROMOTED bindings of a cluster into per-channel effectiveness and
//! per-category reliability, kept as running sums so a newly promoted binding
//! is folded in with a weighted-mean update instead of a full recompute. Each
//! binding's contribution is remembered so it can be subtracted exactly when
//! the binding leaves PROMOTED.

use chrono::Utc;

use crate::config::AggregatorConfig;
use crate::types::{clamp_unit, BindingContribution, BindingState, ClusterIntelligence, RuntimeBinding};

pub struct ClusterAggregator {
    config: AggregatorConfig,
}

/// What a binding brings to its cluster.
pub fn contribution(binding: &RuntimeBinding) -> BindingContribution {
    BindingContribution {
        channel_success: binding
            .discovered_channels
            .iter()
            .filter(|(_, s)| s.attempts > 0)
            .map(|(c, s)| (c.clone(), s.success_rate()))
            .collect(),
        category_confidence: binding.category_confidence.clone(),
    }
}

impl ClusterAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    /// Full rollup from a set of bindings. Anything not PROMOTED is ignored.
    pub fn rollup(&self, cluster_id: &str, bindings: &[RuntimeBinding]) -> ClusterIntelligence {
        let mut intel = ClusterIntelligence::empty(cluster_id);
        for binding in bindings {
            self.add_binding(&mut intel, binding);
        }
        intel
    }

    /// Fold a PROMOTED binding into the aggregate. A binding already counted
    /// is replaced. Returns false (and changes nothing) for other states.
    pub fn add_binding(&self, intel: &mut ClusterIntelligence, binding: &RuntimeBinding) -> bool {
        if binding.state != BindingState::Promoted {
            log::debug!(
                "Aggregator: ignoring {} binding {} for {}",
                binding.state,
                binding.entity_id,
                intel.cluster_id
            );
            return false;
        }
        self.remove_binding(intel, &binding.entity_id);

        let added = contribution(binding);
        for (channel, value) in &added.channel_success {
            let total = intel.channel_totals.entry(channel.clone()).or_default();
            total.sum += value;
            total.count += 1;
        }
        for (category, value) in &added.category_confidence {
            let total = intel.category_totals.entry(category.clone()).or_default();
            total.sum += value;
            total.count += 1;
        }
        intel.contributors.insert(binding.entity_id.clone(), added);
        self.refresh(intel);
        log::info!(
            "Aggregator: {} added to {} ({} promoted, shortcuts {:?})",
            binding.entity_id,
            intel.cluster_id,
            intel.promoted_count(),
            intel.discovery_shortcuts
        );
        true
    }

    /// Subtract a binding's remembered contribution. Returns false if it was not counted.
    pub fn remove_binding(&self, intel: &mut ClusterIntelligence, entity_id: &str) -> bool {
        let Some(removed) = intel.contributors.remove(entity_id) else {
            return false;
        };
        for (channel, value) in &removed.channel_success {
            subtract(&mut intel.channel_totals, channel, *value);
        }
        for (category, value) in &removed.category_confidence {
            subtract(&mut intel.category_totals, category, *value);
        }
        self.refresh(intel);
        log::info!("Aggregator: {} removed from {}", entity_id, intel.cluster_id);
        true
    }

    /// Recompute the derived tables from the running totals.
    fn refresh(&self, intel: &mut ClusterIntelligence) {
        intel.channel_effectiveness = intel
            .channel_totals
            .iter()
            .map(|(c, t)| (c.clone(), clamp_unit(t.mean())))
            .collect();
        intel.signal_reliability = intel
            .category_totals
            .iter()
            .map(|(c, t)| (c.clone(), clamp_unit(t.mean())))
            .collect();

        let mut ranked: Vec<(&String, f64)> = intel
            .channel_effectiveness
            .iter()
            .filter(|(_, v)| **v > 0.0)
            .map(|(c, v)| (c, *v))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        intel.discovery_shortcuts = ranked
            .into_iter()
            .take(self.config.shortcut_top_n)
            .map(|(c, _)| c.clone())
            .collect();
        intel.updated_at = Utc::now();
    }
}

fn subtract(
    totals: &mut std::collections::BTreeMap<String, crate::types::RunningMean>,
    key: &str,
    value: f64,
) {
    let emptied = match totals.get_mut(key) {
        Some(total) => {
            total.sum -= value;
            total.count = total.count.saturating_sub(1);
            total.count == 0
        }
        None => false,
    };
    if emptied {
        totals.remove(key);
    }
}
