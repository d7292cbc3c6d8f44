//! Ingestion surface for raw episode records.
//!
//! Records arrive as loose JSON (webhooks, the CLI) and are validated into
//! immutable `Episode`s here so that malformed data fails at the boundary
//! instead of deep inside clustering or scoring. Accepted episodes are
//! appended to the store and their entity is marked dirty so the next pass
//! re-clusters its timeline.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entity::Entity;
use crate::error::DiscoveryError;
use crate::store::PersistentStore;
use crate::types::{Episode, SkippedEpisode};

/// Hop type recorded when the sender does not say where the content came from.
const UNKNOWN_HOP: &str = "external";

/// An episode as received from outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub entity_id: String,
    #[serde(default)]
    pub hop_type: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    pub raw_text: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl EpisodeRecord {
    /// Validate into an `Episode`. `dimension` is the active embedding size;
    /// a supplied embedding of any other size is refused.
    pub fn into_episode(self, dimension: usize) -> Result<Episode, DiscoveryError> {
        let label = self.id.clone().unwrap_or_else(|| "<unassigned>".to_string());
        let malformed = |reason: String| DiscoveryError::MalformedEpisode {
            id: label.clone(),
            reason,
        };

        let entity_id = self.entity_id.trim().to_string();
        if entity_id.is_empty() {
            return Err(malformed("entity_id is empty".to_string()));
        }
        let raw_text = self.raw_text.trim().to_string();
        if raw_text.is_empty() {
            return Err(malformed("raw_text is empty".to_string()));
        }
        let timestamp = DateTime::parse_from_rfc3339(self.timestamp.trim())
            .map_err(|e| malformed(format!("timestamp {:?}: {}", self.timestamp, e)))?
            .with_timezone(&Utc);

        if let Some(embedding) = &self.embedding {
            if embedding.len() != dimension {
                return Err(malformed(format!(
                    "embedding has {} dimensions, expected {}",
                    embedding.len(),
                    dimension
                )));
            }
            if embedding.iter().any(|v| !v.is_finite()) {
                return Err(malformed("embedding contains non-finite values".to_string()));
            }
        }

        let hop_type = self
            .hop_type
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| UNKNOWN_HOP.to_string());
        let source_url = self.source_url.map(|u| u.trim().to_string()).unwrap_or_default();
        let id = match self.id.map(|i| i.trim().to_string()).filter(|i| !i.is_empty()) {
            Some(id) => id,
            None => episode_id(&entity_id, &source_url, &timestamp, &raw_text),
        };

        Ok(Episode {
            id,
            entity_id,
            hop_type,
            source_url,
            timestamp,
            raw_text,
            embedding: self.embedding,
        })
    }
}

/// Content-derived episode id, so the same record re-sent twice dedups.
pub fn episode_id(entity_id: &str, source_url: &str, timestamp: &DateTime<Utc>, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_id.as_bytes());
    hasher.update(b"|");
    hasher.update(source_url.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("ep-{}", &digest[..16])
}

/// Entities with episodes that arrived since their last clustering pass.
///
/// Deduplicates by episode id within the pending window; draining an entity
/// clears its pending set.
#[derive(Default)]
pub struct IngestionQueue {
    pending: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl IngestionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted episode. Returns false if it was already pending.
    pub fn mark(&self, entity_id: &str, episode_id: &str) -> bool {
        let mut pending = self.pending.lock();
        let inserted = pending
            .entry(entity_id.to_string())
            .or_default()
            .insert(episode_id.to_string());
        if !inserted {
            log::debug!("Ingest: {} already pending for {}", episode_id, entity_id);
        }
        inserted
    }

    pub fn is_dirty(&self, entity_id: &str) -> bool {
        self.pending
            .lock()
            .get(entity_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    pub fn pending_count(&self, entity_id: &str) -> usize {
        self.pending.lock().get(entity_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Clear one entity once its timeline has been re-clustered.
    pub fn drain_entity(&self, entity_id: &str) -> usize {
        self.pending
            .lock()
            .remove(entity_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Take every dirty entity with its pending count, in id order.
    pub fn drain_all(&self) -> Vec<(String, usize)> {
        let drained = std::mem::take(&mut *self.pending.lock());
        drained
            .into_iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(entity, ids)| (entity, ids.len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one ingestion call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub accepted: Vec<String>,
    pub duplicates: Vec<String>,
    pub rejected: Vec<SkippedEpisode>,
}

/// Validate, persist, and queue a batch of raw records.
///
/// Malformed records are rejected individually and never abort the batch.
/// Entities seen for the first time are created with their id as name.
pub fn ingest_episodes(
    store: &dyn PersistentStore,
    queue: &IngestionQueue,
    records: Vec<EpisodeRecord>,
    dimension: usize,
) -> Result<IngestReport, DiscoveryError> {
    let mut report = IngestReport::default();

    for record in records {
        let fallback_id = record.id.clone().unwrap_or_default();
        let episode = match record.into_episode(dimension) {
            Ok(episode) => episode,
            Err(e) => {
                log::warn!("Ingest: skipping record: {}", e);
                report.rejected.push(SkippedEpisode {
                    episode_id: fallback_id,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if store.get_entity(&episode.entity_id)?.is_none() {
            log::info!("Ingest: first observation of entity {}", episode.entity_id);
            store.upsert_entity(&Entity::new(&episode.entity_id, &episode.entity_id))?;
        }

        match store.append_episode(&episode) {
            Ok(true) => {
                queue.mark(&episode.entity_id, &episode.id);
                report.accepted.push(episode.id);
            }
            Ok(false) => report.duplicates.push(episode.id),
            Err(crate::store::StoreError::ImmutableRecord(reason)) => {
                log::warn!("Ingest: refusing edit of {}: {}", episode.id, reason);
                report.rejected.push(SkippedEpisode {
                    episode_id: episode.id,
                    reason,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }

    log::info!(
        "Ingest: {} accepted, {} duplicate, {} rejected",
        report.accepted.len(),
        report.duplicates.len(),
        report.rejected.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(id: Option<&str>, text: &str) -> EpisodeRecord {
        EpisodeRecord {
            id: id.map(|s| s.to_string()),
            entity_id: "acme".into(),
            hop_type: Some("jobs_board".into()),
            source_url: Some("https://jobs.example/acme/crm-admin".into()),
            timestamp: "2026-03-01T09:00:00Z".into(),
            raw_text: text.into(),
            embedding: None,
        }
    }

    #[test]
    fn test_valid_record_becomes_episode() {
        let episode = record(Some("ep-1"), "  Hiring Salesforce admin ")
            .into_episode(4)
            .expect("valid");
        assert_eq!(episode.id, "ep-1");
        assert_eq!(episode.raw_text, "Hiring Salesforce admin");
        assert_eq!(episode.hop_type, "jobs_board");
    }

    #[test]
    fn test_missing_id_is_content_derived() {
        let a = record(None, "Hiring Salesforce admin").into_episode(4).unwrap();
        let b = record(None, "Hiring Salesforce admin").into_episode(4).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("ep-"));
    }

    #[test]
    fn test_malformed_records_rejected() {
        let mut bad_time = record(Some("ep-1"), "text");
        bad_time.timestamp = "last tuesday".into();
        assert!(matches!(
            bad_time.into_episode(4),
            Err(DiscoveryError::MalformedEpisode { .. })
        ));

        assert!(record(Some("ep-2"), "   ").into_episode(4).is_err());

        let mut wrong_dim = record(Some("ep-3"), "text");
        wrong_dim.embedding = Some(vec![0.1, 0.2]);
        assert!(wrong_dim.into_episode(4).is_err());

        let mut nan = record(Some("ep-4"), "text");
        nan.embedding = Some(vec![0.1, f32::NAN, 0.0, 0.0]);
        assert!(nan.into_episode(4).is_err());
    }

    #[test]
    fn test_ingest_dedups_and_marks_dirty() {
        let store = MemoryStore::new();
        let queue = IngestionQueue::new();
        let mut bad = record(Some("ep-bad"), "text");
        bad.timestamp = String::new();

        let report = ingest_episodes(
            &store,
            &queue,
            vec![
                record(Some("ep-1"), "Hiring Salesforce admin"),
                record(Some("ep-1"), "Hiring Salesforce admin"),
                bad,
            ],
            4,
        )
        .expect("ingest");

        assert_eq!(report.accepted, vec!["ep-1".to_string()]);
        assert_eq!(report.duplicates, vec!["ep-1".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert!(queue.is_dirty("acme"));
        assert_eq!(queue.pending_count("acme"), 1);
        assert!(store.get_entity("acme").unwrap().is_some());
    }

    #[test]
    fn test_queue_drain() {
        let queue = IngestionQueue::new();
        assert!(queue.mark("acme", "ep-1"));
        assert!(!queue.mark("acme", "ep-1"));
        assert!(queue.mark("globex", "ep-2"));
        assert_eq!(queue.drain_entity("acme"), 1);
        assert!(!queue.is_dirty("acme"));
        assert_eq!(queue.drain_all(), vec![("globex".to_string(), 1)]);
        assert!(queue.is_empty());
    }
}
