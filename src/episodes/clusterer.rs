//! Temporal + semantic compression of an entity's evidence timeline.
//!
//! Episodes are sorted by timestamp (id breaks ties). Each unassigned episode
//! anchors a group that absorbs later unassigned episodes within
//! `time_window_days` of the anchor whose embedding similarity to the anchor
//! reaches `similarity_threshold`, up to `max_cluster_size` members. Because
//! the anchor is the earliest member, no two members of a group are further
//! apart than the window. Groups smaller than `min_cluster_size` are reported
//! as stand-alone episodes.
//!
//! The output is a pure function of the input set, so re-running on the same
//! episodes yields the same timeline.

use std::sync::Arc;

use chrono::Duration;

use crate::config::ClusteringConfig;
use crate::embeddings::{cosine_similarity, mean_embedding, EmbeddingStrategy};
use crate::types::{ClusteredEpisode, ClusteredTimeline, Episode, SkippedEpisode, TimeSpan};

/// Separator between member texts in a consolidated episode.
const TEXT_SEPARATOR: &str = "\n---\n";

pub struct EpisodeClusterer {
    config: ClusteringConfig,
    strategy: Arc<dyn EmbeddingStrategy>,
}

/// An episode with the embedding clustering will use.
struct Prepared<'a> {
    episode: &'a Episode,
    embedding: Vec<f32>,
}

impl EpisodeClusterer {
    pub fn new(config: ClusteringConfig, strategy: Arc<dyn EmbeddingStrategy>) -> Self {
        Self { config, strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Compress all episodes of one entity into an ordered timeline.
    pub fn compress(&self, entity_id: &str, episodes: &[Episode]) -> ClusteredTimeline {
        let mut timeline = ClusteredTimeline::empty(entity_id);
        let mut prepared = Vec::with_capacity(episodes.len());

        for episode in episodes {
            match self.prepare(entity_id, episode) {
                Ok(p) => prepared.push(p),
                Err(reason) => {
                    log::warn!("Clusterer: skipping episode {}: {}", episode.id, reason);
                    timeline.skipped.push(SkippedEpisode {
                        episode_id: episode.id.clone(),
                        reason,
                    });
                }
            }
        }

        prepared.sort_by(|a, b| {
            a.episode
                .timestamp
                .cmp(&b.episode.timestamp)
                .then_with(|| a.episode.id.cmp(&b.episode.id))
        });
        // Same id seen twice in the input: keep the first copy.
        prepared.dedup_by(|b, a| a.episode.id == b.episode.id);
        timeline.raw_episode_count = prepared.len();

        let window = Duration::days(self.config.time_window_days);
        let max_size = self.config.max_cluster_size.max(1);
        let mut assigned = vec![false; prepared.len()];

        for anchor in 0..prepared.len() {
            if assigned[anchor] {
                continue;
            }
            assigned[anchor] = true;
            let mut group = vec![anchor];
            let anchor_ts = prepared[anchor].episode.timestamp;

            for candidate in (anchor + 1)..prepared.len() {
                if group.len() >= max_size {
                    break;
                }
                if prepared[candidate].episode.timestamp - anchor_ts > window {
                    break;
                }
                if assigned[candidate] {
                    continue;
                }
                let similarity =
                    cosine_similarity(&prepared[anchor].embedding, &prepared[candidate].embedding);
                if similarity >= self.config.similarity_threshold {
                    assigned[candidate] = true;
                    group.push(candidate);
                }
            }

            if group.len() >= self.config.min_cluster_size {
                timeline.episodes.push(consolidate(&prepared, &group));
            } else {
                for member in group {
                    timeline.episodes.push(consolidate(&prepared, &[member]));
                }
            }
        }

        timeline.episodes.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.cluster_members.cmp(&b.cluster_members))
        });

        log::debug!(
            "Clusterer: {} -> {} raw, {} clustered, {} skipped (ratio {:.2})",
            entity_id,
            timeline.raw_episode_count,
            timeline.episodes.len(),
            timeline.skipped.len(),
            timeline.compression_ratio()
        );
        timeline
    }

    fn prepare<'a>(&self, entity_id: &str, episode: &'a Episode) -> Result<Prepared<'a>, String> {
        if episode.entity_id != entity_id {
            return Err(format!("belongs to entity {}", episode.entity_id));
        }
        let dimension = self.strategy.dimension();
        match &episode.embedding {
            Some(embedding) if embedding.iter().any(|v| !v.is_finite()) => {
                Err("embedding contains non-finite values".to_string())
            }
            Some(embedding) if embedding.len() == dimension => Ok(Prepared {
                episode,
                embedding: embedding.clone(),
            }),
            _ => {
                if episode.raw_text.trim().is_empty() {
                    return Err("missing embedding and no text to embed".to_string());
                }
                let embedding = self
                    .strategy
                    .embed(&episode.raw_text)
                    .map_err(|e| format!("missing embedding ({} strategy: {})", self.strategy.name(), e))?;
                if embedding.len() != dimension {
                    return Err(format!(
                        "{} strategy returned {} dimensions, expected {}",
                        self.strategy.name(),
                        embedding.len(),
                        dimension
                    ));
                }
                Ok(Prepared { episode, embedding })
            }
        }
    }
}

/// Build one timeline entry from sorted member indices (oldest first).
fn consolidate(prepared: &[Prepared<'_>], members: &[usize]) -> ClusteredEpisode {
    let oldest = prepared[members[0]].episode.timestamp;
    let newest = members
        .iter()
        .map(|&i| prepared[i].episode.timestamp)
        .max()
        .unwrap_or(oldest);

    let vectors: Vec<&[f32]> = members.iter().map(|&i| prepared[i].embedding.as_slice()).collect();
    let representative_embedding = if vectors.len() == 1 {
        vectors[0].to_vec()
    } else {
        mean_embedding(&vectors)
    };

    // Most recent first.
    let mut by_recency: Vec<&Episode> = members.iter().map(|&i| prepared[i].episode).collect();
    by_recency.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));

    let consolidated_text = by_recency
        .iter()
        .map(|e| e.raw_text.as_str())
        .collect::<Vec<_>>()
        .join(TEXT_SEPARATOR);

    let mut hop_types: Vec<String> = Vec::new();
    let mut source_urls: Vec<String> = Vec::new();
    for episode in &by_recency {
        if !hop_types.contains(&episode.hop_type) {
            hop_types.push(episode.hop_type.clone());
        }
        if !episode.source_url.is_empty() && !source_urls.contains(&episode.source_url) {
            source_urls.push(episode.source_url.clone());
        }
    }

    ClusteredEpisode {
        cluster_members: members.iter().map(|&i| prepared[i].episode.id.clone()).collect(),
        representative_embedding,
        time_span: TimeSpan {
            start: oldest,
            end: newest,
        },
        timestamp: newest,
        consolidated_text,
        hop_types,
        source_urls,
    }
}
