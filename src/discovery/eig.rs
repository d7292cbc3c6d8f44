//! Expected-information-gain prioritisation.
//!
//! `EIG = (1 - confidence) × novelty × info_value(category)`
//!
//! Novelty decays with the evidence already gathered for a hypothesis using
//! the same half-life curve as signal decay: `max(floor, 2^(-n / half_life))`.

use std::cmp::Ordering;

use crate::config::EngineConfig;
use crate::types::{clamp_unit, ClusteredTimeline, Hypothesis};

/// Novelty for a hypothesis with `evidence_count` items of evidence.
pub fn novelty(evidence_count: u32, half_life: f64, floor: f64) -> f64 {
    let floor = floor.clamp(f64::MIN_POSITIVE, 1.0);
    if half_life <= 0.0 {
        return floor;
    }
    let decayed = (2.0_f64).powf(-(evidence_count as f64) / half_life);
    decayed.max(floor).min(1.0)
}

pub struct EigPrioritizer<'a> {
    config: &'a EngineConfig,
}

impl<'a> EigPrioritizer<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn info_value(&self, category: &str) -> f64 {
        self.config.category_value(category)
    }

    pub fn score(&self, hypothesis: &Hypothesis) -> f64 {
        let uncertainty = 1.0 - clamp_unit(hypothesis.confidence);
        let novelty = novelty(
            hypothesis.evidence_count,
            self.config.eig.novelty_half_life,
            self.config.eig.novelty_floor,
        );
        uncertainty * novelty * self.info_value(&hypothesis.category)
    }

    /// Indices of `hypotheses` with their scores, best first. Ties go to the
    /// higher confidence, then the lower id, so ranking is deterministic.
    pub fn rank(&self, hypotheses: &[Hypothesis]) -> Vec<(usize, f64)> {
        let mut ranked: Vec<(usize, f64)> = hypotheses
            .iter()
            .enumerate()
            .map(|(i, h)| (i, self.score(h)))
            .collect();
        ranked.sort_by(|(ia, sa), (ib, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    hypotheses[*ib]
                        .confidence
                        .partial_cmp(&hypotheses[*ia].confidence)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| hypotheses[*ia].id.cmp(&hypotheses[*ib].id))
        });
        ranked
    }
}

/// Seed each hypothesis's evidence count from the entity's compressed
/// timeline: one item per clustered episode whose text mentions the category
/// or its mapped capability. Counts never go down.
pub fn seed_evidence(hypotheses: &mut [Hypothesis], timeline: &ClusteredTimeline) {
    let texts: Vec<String> = timeline
        .episodes
        .iter()
        .map(|e| e.consolidated_text.to_lowercase())
        .collect();
    for hypothesis in hypotheses.iter_mut() {
        let mut terms = vec![hypothesis.category.to_lowercase().replace('_', " ")];
        if let Some(capability) = &hypothesis.mapped_capability {
            let capability = capability.to_lowercase().replace('_', " ");
            if !terms.contains(&capability) {
                terms.push(capability);
            }
        }
        let mentions = texts
            .iter()
            .filter(|t| terms.iter().any(|term| t.contains(term.as_str())))
            .count() as u32;
        if mentions > hypothesis.evidence_count {
            hypothesis.evidence_count = mentions;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusteredEpisode, TimeSpan};
    use chrono::Utc;

    fn hypothesis(category: &str, confidence: f64) -> Hypothesis {
        Hypothesis {
            id: format!("hyp-{category}"),
            entity_id: "acme".into(),
            category: category.into(),
            confidence,
            derived_from: None,
            mapped_capability: None,
            channels: vec![],
            shortcut_channels: vec![],
            evidence_count: 0,
            depth: 0,
        }
    }

    #[test]
    fn test_novelty_halves_at_half_life_and_floors() {
        assert!((novelty(0, 3.0, 0.2) - 1.0).abs() < 1e-9);
        assert!((novelty(3, 3.0, 0.2) - 0.5).abs() < 1e-9);
        assert!((novelty(30, 3.0, 0.2) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_score_formula() {
        let config = EngineConfig::default();
        let eig = EigPrioritizer::new(&config);
        let crm = hypothesis("CRM", 0.5);
        assert!((eig.score(&crm) - 0.5 * 1.0 * 1.3).abs() < 1e-9);
        let payroll = hypothesis("payroll", 0.5);
        assert!((eig.score(&payroll) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_eig_non_increasing_as_confidence_rises() {
        let config = EngineConfig::default();
        let eig = EigPrioritizer::new(&config);
        let mut previous = f64::INFINITY;
        for step in 0..=20 {
            let h = hypothesis("ERP", step as f64 / 20.0);
            let score = eig.score(&h);
            assert!(score <= previous + 1e-12);
            previous = score;
        }
        assert_eq!(eig.score(&hypothesis("ERP", 1.0)), 0.0);
    }

    #[test]
    fn test_rank_orders_by_score_then_confidence() {
        let config = EngineConfig::default();
        let eig = EigPrioritizer::new(&config);
        let hyps = vec![
            hypothesis("payroll", 0.2),
            hypothesis("CRM", 0.2),
            hypothesis("ERP", 0.9),
        ];
        let order: Vec<usize> = eig.rank(&hyps).into_iter().map(|(i, _)| i).collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn test_seed_evidence_from_timeline() {
        let now = Utc::now();
        let entry = |text: &str| ClusteredEpisode {
            cluster_members: vec!["e".into()],
            representative_embedding: vec![],
            time_span: TimeSpan { start: now, end: now },
            timestamp: now,
            consolidated_text: text.into(),
            hop_types: vec![],
            source_urls: vec![],
        };
        let mut timeline = crate::types::ClusteredTimeline::empty("acme");
        timeline.episodes = vec![
            entry("Acme evaluating new CRM vendors"),
            entry("Acme cloud migration to AWS"),
            entry("Acme CRM admin role posted"),
        ];
        let mut hyps = vec![hypothesis("CRM", 0.5), hypothesis("cloud_migration", 0.5)];
        seed_evidence(&mut hyps, &timeline);
        assert_eq!(hyps[0].evidence_count, 2);
        assert_eq!(hyps[1].evidence_count, 1);
    }
}
