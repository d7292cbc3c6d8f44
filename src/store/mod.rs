//! Persistent store for entities, bindings, hypotheses, episodes, cluster
//! intelligence, and templates.
//!
//! Components never touch storage directly; a `PersistentStore` is injected.
//! Every implementation runs the same write-boundary checks so an invalid
//! record is rejected and the prior valid value stays in place.

use thiserror::Error;

use crate::entity::Entity;
use crate::lifecycle::check_transition;
use crate::types::{
    is_unit, ClusterIntelligence, Episode, Hypothesis, RuntimeBinding, Template,
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Record is immutable: {0}")]
    ImmutableRecord(String),
}

pub trait PersistentStore: Send + Sync {
    fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError>;
    fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError>;
    fn list_entities(&self) -> Result<Vec<Entity>, StoreError>;
    fn entities_in_cluster(&self, cluster_id: &str) -> Result<Vec<Entity>, StoreError>;

    fn get_binding(&self, entity_id: &str) -> Result<Option<RuntimeBinding>, StoreError>;
    fn upsert_binding(&self, binding: &RuntimeBinding) -> Result<(), StoreError>;
    fn list_bindings(&self) -> Result<Vec<RuntimeBinding>, StoreError>;

    fn hypotheses_for_entity(&self, entity_id: &str) -> Result<Vec<Hypothesis>, StoreError>;
    /// Replace the entity's hypothesis set wholesale.
    fn replace_hypotheses(&self, entity_id: &str, hypotheses: &[Hypothesis]) -> Result<(), StoreError>;
    fn list_hypotheses(&self) -> Result<Vec<Hypothesis>, StoreError>;

    /// Append an immutable episode. Returns false if the identical episode was already stored.
    fn append_episode(&self, episode: &Episode) -> Result<bool, StoreError>;
    fn episodes_for_entity(&self, entity_id: &str) -> Result<Vec<Episode>, StoreError>;

    fn get_cluster_intel(&self, cluster_id: &str) -> Result<Option<ClusterIntelligence>, StoreError>;
    fn upsert_cluster_intel(&self, intel: &ClusterIntelligence) -> Result<(), StoreError>;

    fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError>;
    /// Highest published version for the cluster.
    fn latest_template(&self, cluster_id: &str) -> Result<Option<Template>, StoreError>;
    /// Publish a template. Re-publishing an id with different content is refused.
    fn publish_template(&self, template: &Template) -> Result<(), StoreError>;

    /// Bindings of every entity assigned to `cluster_id`.
    fn bindings_in_cluster(&self, cluster_id: &str) -> Result<Vec<RuntimeBinding>, StoreError> {
        let mut bindings = Vec::new();
        for entity in self.entities_in_cluster(cluster_id)? {
            if let Some(binding) = self.get_binding(&entity.id)? {
                bindings.push(binding);
            }
        }
        Ok(bindings)
    }
}

// ---------------------------------------------------------------------------
// Write-boundary checks shared by all implementations
// ---------------------------------------------------------------------------

pub(crate) fn check_entity(entity: &Entity) -> Result<(), StoreError> {
    if entity.id.trim().is_empty() {
        return Err(StoreError::Invariant("entity id is empty".to_string()));
    }
    Ok(())
}

pub(crate) fn check_entity_cluster_change(
    existing: Option<&Entity>,
    incoming: &Entity,
) -> Result<(), StoreError> {
    if let Some(existing) = existing {
        if let (Some(old), Some(new)) = (&existing.cluster_id, &incoming.cluster_id) {
            if old != new {
                return Err(StoreError::ImmutableRecord(format!(
                    "entity {} cluster {} cannot change to {}",
                    incoming.id, old, new
                )));
            }
        }
        if existing.cluster_id.is_some() && incoming.cluster_id.is_none() {
            return Err(StoreError::ImmutableRecord(format!(
                "entity {} cluster assignment cannot be cleared",
                incoming.id
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_binding(binding: &RuntimeBinding) -> Result<(), StoreError> {
    binding.validate().map_err(|reason| {
        log::warn!(
            "Store: rejected binding write for {}: {}",
            binding.entity_id,
            reason
        );
        StoreError::Invariant(reason)
    })
}

/// A state change on an existing binding must follow the transition table.
pub(crate) fn check_binding_transition(
    existing: Option<&RuntimeBinding>,
    incoming: &RuntimeBinding,
) -> Result<(), StoreError> {
    let Some(existing) = existing else {
        return Ok(());
    };
    if existing.state == incoming.state {
        return Ok(());
    }
    check_transition(existing.state, incoming.state).map_err(|err| {
        log::warn!(
            "Store: rejected binding write for {}: {}",
            incoming.entity_id,
            err
        );
        StoreError::Invariant(err.to_string())
    })
}

pub(crate) fn check_hypotheses(entity_id: &str, hypotheses: &[Hypothesis]) -> Result<(), StoreError> {
    for h in hypotheses {
        if h.entity_id != entity_id {
            return Err(StoreError::Invariant(format!(
                "hypothesis {} belongs to {}, not {}",
                h.id, h.entity_id, entity_id
            )));
        }
        if !is_unit(h.confidence) {
            log::warn!(
                "Store: rejected hypothesis {} with confidence {}",
                h.id,
                h.confidence
            );
            return Err(StoreError::Invariant(format!(
                "hypothesis {} confidence {} out of [0,1]",
                h.id, h.confidence
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_cluster_intel(intel: &ClusterIntelligence) -> Result<(), StoreError> {
    for (channel, value) in &intel.channel_effectiveness {
        if !is_unit(*value) {
            return Err(StoreError::Invariant(format!(
                "channel {} effectiveness {} out of [0,1]",
                channel, value
            )));
        }
    }
    for (category, value) in &intel.signal_reliability {
        if !is_unit(*value) {
            return Err(StoreError::Invariant(format!(
                "category {} reliability {} out of [0,1]",
                category, value
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_template(template: &Template) -> Result<(), StoreError> {
    if !is_unit(template.confidence_score) {
        return Err(StoreError::Invariant(format!(
            "template {} confidence_score {} out of [0,1]",
            template.id, template.confidence_score
        )));
    }
    for pattern in &template.signal_patterns {
        if !is_unit(pattern.confidence) {
            return Err(StoreError::Invariant(format!(
                "template {} pattern {} confidence {} out of [0,1]",
                template.id, pattern.category, pattern.confidence
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_template_immutable(
    existing: Option<&Template>,
    incoming: &Template,
) -> Result<(), StoreError> {
    match existing {
        Some(existing) if existing != incoming => Err(StoreError::ImmutableRecord(format!(
            "template {} is already published",
            incoming.id
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn check_episode_immutable(
    existing: Option<&Episode>,
    incoming: &Episode,
) -> Result<bool, StoreError> {
    match existing {
        None => Ok(true),
        Some(existing) if existing == incoming => Ok(false),
        Some(_) => Err(StoreError::ImmutableRecord(format!(
            "episode {} already exists with different content",
            incoming.id
        ))),
    }
}
