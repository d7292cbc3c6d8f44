//! "Top opportunities" read: hypotheses across entities, strongest first,
//! joined with the entity's cluster and binding state.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::{PersistentStore, StoreError};
use crate::types::BindingState;

#[derive(Debug, Clone, Default)]
pub struct OpportunityFilter {
    pub cluster_id: Option<String>,
    /// Case-insensitive category match.
    pub category: Option<String>,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub entity_id: String,
    pub entity_name: String,
    pub cluster_id: Option<String>,
    pub hypothesis_id: String,
    pub category: String,
    pub confidence: f64,
    pub mapped_capability: Option<String>,
    pub binding_state: Option<BindingState>,
}

pub fn top_opportunities(
    store: &dyn PersistentStore,
    filter: &OpportunityFilter,
) -> Result<Vec<Opportunity>, StoreError> {
    let entities: HashMap<String, _> = store
        .list_entities()?
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect();
    let states: HashMap<String, BindingState> = store
        .list_bindings()?
        .into_iter()
        .map(|b| (b.entity_id, b.state))
        .collect();

    let mut rows: Vec<Opportunity> = Vec::new();
    for h in store.list_hypotheses()? {
        if let Some(min) = filter.min_confidence {
            if h.confidence < min {
                continue;
            }
        }
        if let Some(category) = &filter.category {
            if !h.category.eq_ignore_ascii_case(category) {
                continue;
            }
        }
        let entity = entities.get(&h.entity_id);
        let cluster_id = entity.and_then(|e| e.cluster_id.clone());
        if let Some(wanted) = &filter.cluster_id {
            if cluster_id.as_deref() != Some(wanted.as_str()) {
                continue;
            }
        }
        rows.push(Opportunity {
            entity_name: entity
                .map(|e| e.name.clone())
                .unwrap_or_else(|| h.entity_id.clone()),
            cluster_id,
            binding_state: states.get(&h.entity_id).copied(),
            entity_id: h.entity_id,
            hypothesis_id: h.id,
            category: h.category,
            confidence: h.confidence,
            mapped_capability: h.mapped_capability,
        });
    }

    rows.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
            .then_with(|| a.hypothesis_id.cmp(&b.hypothesis_id))
    });
    if let Some(limit) = filter.limit {
        rows.truncate(limit);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::store::MemoryStore;
    use crate::types::{Hypothesis, RuntimeBinding};

    fn hyp(entity: &str, category: &str, confidence: f64) -> Hypothesis {
        Hypothesis {
            id: format!("hyp-{entity}-{category}"),
            entity_id: entity.into(),
            category: category.into(),
            confidence,
            derived_from: None,
            mapped_capability: Some(category.into()),
            channels: vec![],
            shortcut_channels: vec![],
            evidence_count: 0,
            depth: 0,
        }
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .upsert_entity(&Entity::new("acme", "Acme").with_cluster("fintech"))
            .expect("entity");
        store
            .upsert_entity(&Entity::new("beta", "Beta").with_cluster("retail"))
            .expect("entity");
        store
            .replace_hypotheses("acme", &[hyp("acme", "CRM", 0.8), hyp("acme", "ERP", 0.4)])
            .expect("hyp");
        store
            .replace_hypotheses("beta", &[hyp("beta", "crm", 0.9)])
            .expect("hyp");
        let mut binding = RuntimeBinding::new("acme", None);
        binding.state = BindingState::Promoted;
        store.upsert_binding(&binding).expect("binding");
        store
    }

    #[test]
    fn test_sorted_by_confidence_desc() {
        let rows = top_opportunities(&seeded(), &OpportunityFilter::default()).expect("query");
        let confidences: Vec<f64> = rows.iter().map(|r| r.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8, 0.4]);
        assert_eq!(rows[1].binding_state, Some(BindingState::Promoted));
        assert_eq!(rows[0].binding_state, None);
    }

    #[test]
    fn test_filters_compose() {
        let store = seeded();
        let by_category = top_opportunities(
            &store,
            &OpportunityFilter {
                category: Some("CRM".into()),
                ..OpportunityFilter::default()
            },
        )
        .expect("query");
        assert_eq!(by_category.len(), 2);

        let by_cluster = top_opportunities(
            &store,
            &OpportunityFilter {
                cluster_id: Some("fintech".into()),
                min_confidence: Some(0.5),
                ..OpportunityFilter::default()
            },
        )
        .expect("query");
        assert_eq!(by_cluster.len(), 1);
        assert_eq!(by_cluster[0].entity_name, "Acme");

        let limited = top_opportunities(
            &store,
            &OpportunityFilter {
                limit: Some(1),
                ..OpportunityFilter::default()
            },
        )
        .expect("query");
        assert_eq!(limited[0].entity_id, "beta");
        assert_eq!(limited.len(), 1);
    }
}
