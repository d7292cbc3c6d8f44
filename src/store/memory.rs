//! In-memory `PersistentStore`, used by tests and embedders that persist elsewhere.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::entity::Entity;
use crate::types::{ClusterIntelligence, Episode, Hypothesis, RuntimeBinding, Template};

use super::{
    check_binding, check_binding_transition, check_cluster_intel, check_entity,
    check_entity_cluster_change, check_episode_immutable, check_hypotheses, check_template,
    check_template_immutable, PersistentStore, StoreError,
};

#[derive(Default)]
struct Tables {
    entities: BTreeMap<String, Entity>,
    bindings: BTreeMap<String, RuntimeBinding>,
    hypotheses: BTreeMap<String, Vec<Hypothesis>>,
    episodes: BTreeMap<String, Vec<Episode>>,
    cluster_intel: BTreeMap<String, ClusterIntelligence>,
    templates: BTreeMap<String, Template>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        Ok(self.tables.read().entities.get(id).cloned())
    }

    fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        check_entity(entity)?;
        let mut tables = self.tables.write();
        check_entity_cluster_change(tables.entities.get(&entity.id), entity)?;
        tables.entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    fn list_entities(&self) -> Result<Vec<Entity>, StoreError> {
        Ok(self.tables.read().entities.values().cloned().collect())
    }

    fn entities_in_cluster(&self, cluster_id: &str) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .tables
            .read()
            .entities
            .values()
            .filter(|e| e.cluster_id.as_deref() == Some(cluster_id))
            .cloned()
            .collect())
    }

    fn get_binding(&self, entity_id: &str) -> Result<Option<RuntimeBinding>, StoreError> {
        Ok(self.tables.read().bindings.get(entity_id).cloned())
    }

    fn upsert_binding(&self, binding: &RuntimeBinding) -> Result<(), StoreError> {
        check_binding(binding)?;
        let mut tables = self.tables.write();
        check_binding_transition(tables.bindings.get(&binding.entity_id), binding)?;
        tables
            .bindings
            .insert(binding.entity_id.clone(), binding.clone());
        Ok(())
    }

    fn list_bindings(&self) -> Result<Vec<RuntimeBinding>, StoreError> {
        Ok(self.tables.read().bindings.values().cloned().collect())
    }

    fn hypotheses_for_entity(&self, entity_id: &str) -> Result<Vec<Hypothesis>, StoreError> {
        Ok(self
            .tables
            .read()
            .hypotheses
            .get(entity_id)
            .cloned()
            .unwrap_or_default())
    }

    fn replace_hypotheses(&self, entity_id: &str, hypotheses: &[Hypothesis]) -> Result<(), StoreError> {
        check_hypotheses(entity_id, hypotheses)?;
        self.tables
            .write()
            .hypotheses
            .insert(entity_id.to_string(), hypotheses.to_vec());
        Ok(())
    }

    fn list_hypotheses(&self) -> Result<Vec<Hypothesis>, StoreError> {
        Ok(self
            .tables
            .read()
            .hypotheses
            .values()
            .flat_map(|v| v.iter().cloned())
            .collect())
    }

    fn append_episode(&self, episode: &Episode) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let timeline = tables.episodes.entry(episode.entity_id.clone()).or_default();
        let inserted = check_episode_immutable(timeline.iter().find(|e| e.id == episode.id), episode)?;
        if inserted {
            timeline.push(episode.clone());
        }
        Ok(inserted)
    }

    fn episodes_for_entity(&self, entity_id: &str) -> Result<Vec<Episode>, StoreError> {
        Ok(self
            .tables
            .read()
            .episodes
            .get(entity_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_cluster_intel(&self, cluster_id: &str) -> Result<Option<ClusterIntelligence>, StoreError> {
        Ok(self.tables.read().cluster_intel.get(cluster_id).cloned())
    }

    fn upsert_cluster_intel(&self, intel: &ClusterIntelligence) -> Result<(), StoreError> {
        check_cluster_intel(intel)?;
        self.tables
            .write()
            .cluster_intel
            .insert(intel.cluster_id.clone(), intel.clone());
        Ok(())
    }

    fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        Ok(self.tables.read().templates.get(id).cloned())
    }

    fn latest_template(&self, cluster_id: &str) -> Result<Option<Template>, StoreError> {
        Ok(self
            .tables
            .read()
            .templates
            .values()
            .filter(|t| t.cluster_id == cluster_id)
            .max_by_key(|t| t.version)
            .cloned())
    }

    fn publish_template(&self, template: &Template) -> Result<(), StoreError> {
        check_template(template)?;
        let mut tables = self.tables.write();
        check_template_immutable(tables.templates.get(&template.id), template)?;
        tables.templates.insert(template.id.clone(), template.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::BindingState;

    fn episode(id: &str, text: &str) -> Episode {
        Episode {
            id: id.into(),
            entity_id: "acme".into(),
            hop_type: "news".into(),
            source_url: "https://news.example/acme".into(),
            timestamp: Utc::now(),
            raw_text: text.into(),
            embedding: None,
        }
    }

    #[test]
    fn test_illegal_state_change_keeps_prior_binding() {
        let store = MemoryStore::new();
        let mut promoted = RuntimeBinding::new("acme", None);
        promoted.usage_count = 5;
        promoted.success_count = 4;
        promoted.state = BindingState::Promoted;
        store.upsert_binding(&promoted).expect("first write");

        let mut demoted = promoted.clone();
        demoted.state = BindingState::Exploring;
        assert!(matches!(store.upsert_binding(&demoted), Err(StoreError::Invariant(_))));
        assert_eq!(store.get_binding("acme").unwrap().unwrap().state, BindingState::Promoted);

        let mut frozen = promoted.clone();
        frozen.state = BindingState::Frozen;
        store.upsert_binding(&frozen).expect("PROMOTED -> FROZEN is legal");

        let mut thawed = frozen.clone();
        thawed.state = BindingState::Promoted;
        assert!(store.upsert_binding(&thawed).is_err());
        assert_eq!(store.get_binding("acme").unwrap().unwrap().state, BindingState::Frozen);
    }

    #[test]
    fn test_invalid_binding_keeps_prior_value() {
        let store = MemoryStore::new();
        let mut binding = RuntimeBinding::new("acme", None);
        binding.usage_count = 2;
        binding.success_count = 1;
        store.upsert_binding(&binding).expect("valid write");

        let mut bad = binding.clone();
        bad.confidence_adjustment = -1.0;
        assert!(matches!(store.upsert_binding(&bad), Err(StoreError::Invariant(_))));

        let stored = store.get_binding("acme").unwrap().unwrap();
        assert_eq!(stored, binding);
    }

    #[test]
    fn test_hypothesis_out_of_range_rejected() {
        let store = MemoryStore::new();
        let h = Hypothesis {
            id: "h1".into(),
            entity_id: "acme".into(),
            category: "CRM".into(),
            confidence: 1.2,
            derived_from: None,
            mapped_capability: None,
            channels: vec![],
            shortcut_channels: vec![],
            evidence_count: 0,
            depth: 0,
        };
        assert!(store.replace_hypotheses("acme", &[h]).is_err());
        assert!(store.hypotheses_for_entity("acme").unwrap().is_empty());
    }

    #[test]
    fn test_episode_append_is_idempotent_and_immutable() {
        let store = MemoryStore::new();
        let ep = episode("ep-1", "Acme hiring CRM admin");
        assert!(store.append_episode(&ep).unwrap());
        assert!(!store.append_episode(&ep).unwrap());

        let edited = episode("ep-1", "edited text");
        assert!(matches!(
            store.append_episode(&edited),
            Err(StoreError::ImmutableRecord(_))
        ));
        assert_eq!(store.episodes_for_entity("acme").unwrap().len(), 1);
    }

    #[test]
    fn test_entity_cluster_cannot_change() {
        let store = MemoryStore::new();
        store
            .upsert_entity(&Entity::new("acme", "Acme").with_cluster("fintech"))
            .unwrap();
        let moved = Entity::new("acme", "Acme").with_cluster("retail");
        assert!(store.upsert_entity(&moved).is_err());
        assert_eq!(store.entities_in_cluster("fintech").unwrap().len(), 1);
    }

    #[test]
    fn test_latest_template_by_version() {
        let store = MemoryStore::new();
        for version in 1..=2 {
            store
                .publish_template(&Template {
                    id: format!("tpl-fintech-v{version}"),
                    cluster_id: "fintech".into(),
                    version,
                    signal_patterns: vec![],
                    channels: vec![],
                    confidence_score: 0.5,
                    validation_metadata: None,
                })
                .unwrap();
        }
        assert_eq!(store.latest_template("fintech").unwrap().unwrap().version, 2);
        assert!(store.latest_template("retail").unwrap().is_none());
    }
}
