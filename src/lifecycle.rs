//! Runtime binding lifecycle.
//!
//! ```text
//! EXPLORING ──promote──▶ PROMOTED ──stale──▶ FROZEN
//!                           │
//!                           └──demote──▶ RETIRED
//! ```
//!
//! Every state change goes through `check_transition`, which rejects
//! anything not in the table. Bindings are mutated only through
//! `LifecycleManager`, and the engine holds the entity's writer lock around
//! each read-modify-write.

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::config::{AggregatorConfig, LifecycleConfig};
use crate::discovery::DiscoveryResult;
use crate::error::DiscoveryError;
use crate::types::{BindingState, RuntimeBinding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal binding transition {from} -> {to}")]
pub struct TransitionError {
    pub from: BindingState,
    pub to: BindingState,
}

impl From<TransitionError> for DiscoveryError {
    fn from(err: TransitionError) -> Self {
        DiscoveryError::IllegalTransition {
            from: err.from,
            to: err.to,
        }
    }
}

/// The transition table.
pub fn check_transition(from: BindingState, to: BindingState) -> Result<(), TransitionError> {
    use BindingState::*;
    match (from, to) {
        (Exploring, Promoted) | (Promoted, Frozen) | (Promoted, Retired) => Ok(()),
        _ => Err(TransitionError { from, to }),
    }
}

/// A state change applied to a binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub entity_id: String,
    pub from: BindingState,
    pub to: BindingState,
    pub reason: String,
}

pub struct LifecycleManager {
    config: LifecycleConfig,
    shortcut_top_n: usize,
    accept_threshold: f64,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig, aggregator: &AggregatorConfig, accept_threshold: f64) -> Self {
        Self {
            config,
            shortcut_top_n: aggregator.shortcut_top_n,
            accept_threshold,
        }
    }

    /// Whether a binding's counters are still updated by discovery.
    pub fn accepts_executions(state: BindingState) -> bool {
        matches!(state, BindingState::Exploring | BindingState::Promoted)
    }

    /// Fold one pass's executions into the binding's counters.
    ///
    /// Only evaluated hops count as usage; ACCEPT and WEAK_ACCEPT count as
    /// success. `confidence_adjustment` accumulates the net confidence change
    /// and never drops below zero. Returns the number of executions recorded.
    pub fn record_executions(&self, binding: &mut RuntimeBinding, result: &DiscoveryResult) -> u64 {
        if !Self::accepts_executions(binding.state) {
            log::debug!(
                "Lifecycle: {} is {}, executions not recorded",
                binding.entity_id,
                binding.state
            );
            return 0;
        }

        let now = Utc::now();
        let mut recorded = 0u64;
        for execution in result.evaluated() {
            recorded += 1;
            binding.usage_count += 1;
            let stats = binding
                .discovered_channels
                .entry(execution.hop_type.clone())
                .or_default();
            stats.attempts += 1;
            stats.last_used = Some(now);
            if execution.is_success() {
                binding.success_count += 1;
                stats.successes += 1;
            }
        }
        if recorded == 0 {
            return 0;
        }

        let adjustment = binding.confidence_adjustment + result.net_confidence_change();
        binding.confidence_adjustment = if adjustment.is_finite() {
            adjustment.max(0.0)
        } else {
            0.0
        };

        for hypothesis in &result.hypotheses {
            let accepted_here = result
                .evaluated()
                .any(|e| e.hypothesis_id == hypothesis.id && e.is_success());
            if accepted_here && hypothesis.confidence >= self.accept_threshold {
                binding
                    .category_confidence
                    .insert(hypothesis.category.clone(), hypothesis.confidence);
            }
        }

        binding.discovery_shortcuts = self.rank_shortcuts(binding);
        if let Some(last) = result.executions.last() {
            binding.last_processed_hypothesis_id = Some(last.hypothesis_id.clone());
        }
        binding.idle_cycles = 0;
        binding.updated_at = now;
        recorded
    }

    /// Channels with at least one success, best success rate first.
    fn rank_shortcuts(&self, binding: &RuntimeBinding) -> Vec<String> {
        let mut ranked: Vec<(&String, f64)> = binding
            .discovered_channels
            .iter()
            .filter(|(_, s)| s.successes > 0)
            .map(|(c, s)| (c, s.success_rate()))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        ranked
            .into_iter()
            .take(self.shortcut_top_n)
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Count a lifecycle evaluation in which the binding saw no executions.
    pub fn tick_idle(&self, binding: &mut RuntimeBinding) {
        if binding.state == BindingState::Promoted {
            binding.idle_cycles = binding.idle_cycles.saturating_add(1);
            log::debug!(
                "Lifecycle: {} idle cycle {}/{}",
                binding.entity_id,
                binding.idle_cycles,
                self.config.stale_cycle_limit
            );
        }
    }

    pub fn meets_promotion_criteria(&self, binding: &RuntimeBinding) -> bool {
        binding.usage_count >= self.config.min_usage
            && binding.success_rate() >= self.config.min_success_rate
            && binding.confidence_adjustment >= self.config.min_confidence_adjustment
    }

    /// Target state the rules call for, if any.
    fn next_state(&self, binding: &RuntimeBinding) -> Option<(BindingState, String)> {
        match binding.state {
            BindingState::Exploring if self.meets_promotion_criteria(binding) => Some((
                BindingState::Promoted,
                format!(
                    "usage {} success_rate {:.2} adjustment {:.3}",
                    binding.usage_count,
                    binding.success_rate(),
                    binding.confidence_adjustment
                ),
            )),
            BindingState::Promoted
                if binding.fresh_executions() >= self.config.min_fresh_executions
                    && binding.success_rate() < self.config.retire_below_success_rate =>
            {
                Some((
                    BindingState::Retired,
                    format!(
                        "success_rate {:.2} below {:.2} after {} fresh executions",
                        binding.success_rate(),
                        self.config.retire_below_success_rate,
                        binding.fresh_executions()
                    ),
                ))
            }
            BindingState::Promoted if binding.idle_cycles >= self.config.stale_cycle_limit => Some((
                BindingState::Frozen,
                format!("{} idle cycles", binding.idle_cycles),
            )),
            _ => None,
        }
    }

    /// Apply whatever transition the rules call for.
    pub fn evaluate(&self, binding: &mut RuntimeBinding) -> Result<Option<Transition>, TransitionError> {
        let Some((to, reason)) = self.next_state(binding) else {
            return Ok(None);
        };
        self.apply(binding, to, reason).map(Some)
    }

    /// Move a binding to `to` through the transition table.
    pub fn apply(
        &self,
        binding: &mut RuntimeBinding,
        to: BindingState,
        reason: String,
    ) -> Result<Transition, TransitionError> {
        let from = binding.state;
        if let Err(e) = check_transition(from, to) {
            log::warn!("Lifecycle: rejected {} for {}", e, binding.entity_id);
            return Err(e);
        }
        binding.state = to;
        if to == BindingState::Promoted {
            binding.usage_at_promotion = binding.usage_count;
            binding.idle_cycles = 0;
        }
        binding.updated_at = Utc::now();
        log::info!(
            "Lifecycle: {} {} -> {} ({})",
            binding.entity_id,
            from,
            to,
            reason
        );
        Ok(Transition {
            entity_id: binding.entity_id.clone(),
            from,
            to,
            reason,
        })
    }
}
