//! Hypothesis evolution: an ACCEPT whose rationale matches a trigger for the
//! hypothesis's category spawns a more specific child hypothesis.

use regex::Regex;

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::types::{clamp_unit, Hypothesis};

use super::hypotheses::hypothesis_id;

struct CompiledTrigger {
    category: String,
    pattern: Regex,
    follow_up: String,
}

pub struct EvolutionRules {
    triggers: Vec<CompiledTrigger>,
    inheritance: f64,
    max_depth: u8,
}

impl EvolutionRules {
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let mut triggers = Vec::with_capacity(config.evolution_triggers.len());
        for trigger in &config.evolution_triggers {
            let pattern = Regex::new(&trigger.pattern).map_err(|e| {
                DiscoveryError::Configuration(format!(
                    "invalid evolution trigger for {}: {}",
                    trigger.category, e
                ))
            })?;
            triggers.push(CompiledTrigger {
                category: trigger.category.clone(),
                pattern,
                follow_up: trigger.follow_up.clone(),
            });
        }
        Ok(Self {
            triggers,
            inheritance: config.evolution_inheritance,
            max_depth: config.max_evolution_depth,
        })
    }

    /// Child hypothesis for an accepted `parent`, if a trigger fires.
    ///
    /// A parent spawns a given follow-up at most once: a child whose id is
    /// already in `pool` is not produced again.
    pub fn evolve(&self, parent: &Hypothesis, rationale: &str, pool: &[Hypothesis]) -> Option<Hypothesis> {
        if parent.depth >= self.max_depth {
            return None;
        }
        let trigger = self.triggers.iter().find(|t| {
            t.category.eq_ignore_ascii_case(&parent.category) && t.pattern.is_match(rationale)
        })?;

        let id = hypothesis_id(&parent.entity_id, &trigger.follow_up, Some(&parent.id));
        if pool.iter().any(|h| h.id == id) {
            return None;
        }

        log::info!(
            "Evolution: {} {} -> {} (rationale matched {})",
            parent.entity_id,
            parent.category,
            trigger.follow_up,
            trigger.pattern.as_str()
        );
        Some(Hypothesis {
            id,
            entity_id: parent.entity_id.clone(),
            category: trigger.follow_up.clone(),
            confidence: clamp_unit(parent.confidence * self.inheritance),
            derived_from: Some(parent.id.clone()),
            mapped_capability: parent.mapped_capability.clone(),
            channels: parent.channels.clone(),
            shortcut_channels: parent.shortcut_channels.clone(),
            evidence_count: 0,
            depth: parent.depth.saturating_add(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crm(confidence: f64, depth: u8) -> Hypothesis {
        Hypothesis {
            id: "hyp-crm".into(),
            entity_id: "acme".into(),
            category: "CRM".into(),
            confidence,
            derived_from: None,
            mapped_capability: Some("CRM".into()),
            channels: vec!["jobs_board".into()],
            shortcut_channels: vec![],
            evidence_count: 2,
            depth,
        }
    }

    fn rules() -> EvolutionRules {
        EvolutionRules::from_config(&DiscoveryConfig::default()).expect("default triggers compile")
    }

    #[test]
    fn test_trigger_spawns_child() {
        let parent = crm(0.7, 0);
        let child = rules()
            .evolve(&parent, "Job post mentions migrating off Siebel", &[parent.clone()])
            .expect("child");
        assert_eq!(child.category, "CRM_migration");
        assert_eq!(child.derived_from.as_deref(), Some("hyp-crm"));
        assert!((child.confidence - 0.56).abs() < 1e-9);
        assert_eq!(child.depth, 1);
        assert_eq!(child.evidence_count, 0);
    }

    #[test]
    fn test_no_trigger_no_child() {
        let parent = crm(0.7, 0);
        assert!(rules().evolve(&parent, "Hiring a CRM admin", &[]).is_none());
    }

    #[test]
    fn test_child_spawned_once() {
        let parent = crm(0.7, 0);
        let rules = rules();
        let child = rules.evolve(&parent, "replacing legacy CRM", &[]).expect("child");
        assert!(rules
            .evolve(&parent, "replacing legacy CRM", &[parent.clone(), child])
            .is_none());
    }

    #[test]
    fn test_depth_bounded() {
        let parent = crm(0.7, 2);
        assert!(rules().evolve(&parent, "migration planned", &[]).is_none());
    }
}
