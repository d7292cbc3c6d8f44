//! Text embedding strategies for episode clustering.
//!
//! Two implementations sit behind `EmbeddingStrategy`:
//! - `NgramEmbedder`: deterministic character trigrams + word bigrams hashed
//!   into a fixed-size signed vector. Always available.
//! - `ModelEmbedder`: nomic-embed-text-v1.5 via fastembed, behind the
//!   `model-embeddings` feature.
//!
//! The strategy is chosen once at startup by `select_strategy`; clustering
//! only depends on the trait.

use std::sync::Arc;

use unicode_normalization::UnicodeNormalization;

use crate::config::{ClusteringConfig, EmbeddingStrategyKind};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Word bigrams carry more topical signal than character trigrams.
const BIGRAM_WEIGHT: f32 = 1.5;

pub trait EmbeddingStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, String>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

// =============================================================================
// N-gram fallback
// =============================================================================

#[derive(Debug, Clone)]
pub struct NgramEmbedder {
    dimension: usize,
}

impl NgramEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl EmbeddingStrategy for NgramEmbedder {
    fn name(&self) -> &'static str {
        "ngram"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        Ok(ngram_embed(text, self.dimension))
    }
}

/// Stable across processes and toolchains, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn normalize(text: &str) -> String {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn accumulate(vec: &mut [f32], feature: &str, weight: f32) {
    let hash = fnv1a(feature.as_bytes());
    let idx = (hash % vec.len() as u64) as usize;
    let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
    vec[idx] += sign * weight;
}

fn ngram_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0_f32; dimension];
    let normalized = normalize(text);
    if normalized.is_empty() {
        return vec;
    }

    let chars: Vec<char> = normalized.chars().collect();
    if chars.len() < 3 {
        accumulate(&mut vec, &format!("c:{}", normalized), 1.0);
    } else {
        for window in chars.windows(3) {
            let gram: String = window.iter().collect();
            accumulate(&mut vec, &format!("c:{}", gram), 1.0);
        }
    }

    let words: Vec<&str> = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    for pair in words.windows(2) {
        accumulate(&mut vec, &format!("w:{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
    }

    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vec {
            *value /= norm;
        }
    }
    vec
}

// =============================================================================
// Model-backed strategy
// =============================================================================

#[cfg(feature = "model-embeddings")]
pub struct ModelEmbedder {
    model: parking_lot::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "model-embeddings")]
impl ModelEmbedder {
    /// Output size of nomic-embed-text-v1.5.
    pub const DIMENSION: usize = 768;

    pub fn try_new() -> Result<Self, String> {
        let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::NomicEmbedTextV15);
        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| format!("embedding model init failed: {e}"))?;
        Ok(Self {
            model: parking_lot::Mutex::new(model),
        })
    }
}

#[cfg(feature = "model-embeddings")]
impl EmbeddingStrategy for ModelEmbedder {
    fn name(&self) -> &'static str {
        "model"
    }

    fn dimension(&self) -> usize {
        Self::DIMENSION
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let mut out = self
            .model
            .lock()
            .embed(vec![text], None)
            .map_err(|e| format!("embedding failed: {e}"))?;
        out.pop().ok_or_else(|| "embedding model returned no vectors".to_string())
    }
}

/// Pick the embedding strategy for this process. Falls back to n-grams when
/// the model is not compiled in or cannot initialise.
pub fn select_strategy(config: &ClusteringConfig) -> Arc<dyn EmbeddingStrategy> {
    match config.embedding_strategy {
        EmbeddingStrategyKind::Ngram => Arc::new(NgramEmbedder::new(config.embedding_dimension)),
        EmbeddingStrategyKind::Model => model_strategy(config),
    }
}

#[cfg(feature = "model-embeddings")]
fn model_strategy(config: &ClusteringConfig) -> Arc<dyn EmbeddingStrategy> {
    match ModelEmbedder::try_new() {
        Ok(model) => {
            log::info!("Embeddings: using model strategy ({} dims)", ModelEmbedder::DIMENSION);
            Arc::new(model)
        }
        Err(e) => {
            log::warn!("Embeddings: {}; falling back to n-gram strategy", e);
            Arc::new(NgramEmbedder::new(config.embedding_dimension))
        }
    }
}

#[cfg(not(feature = "model-embeddings"))]
fn model_strategy(config: &ClusteringConfig) -> Arc<dyn EmbeddingStrategy> {
    log::warn!("Embeddings: model strategy not compiled in; falling back to n-gram strategy");
    Arc::new(NgramEmbedder::new(config.embedding_dimension))
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (va, vb) in a.iter().zip(b.iter()) {
        dot += va * vb;
        norm_a += va * va;
        norm_b += vb * vb;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Mean of equally sized vectors, L2-normalised.
pub fn mean_embedding(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let dim = first.len();
    let mut out = vec![0.0_f32; dim];
    for v in vectors.iter().filter(|v| v.len() == dim) {
        for (acc, x) in out.iter_mut().zip(v.iter()) {
            *acc += x;
        }
    }
    let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut out {
            *value /= norm;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ngram_is_deterministic() {
        let embedder = NgramEmbedder::new(128);
        let a = embedder.embed("Acme is hiring a Salesforce administrator").unwrap();
        let b = embedder.embed("Acme is hiring a Salesforce administrator").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
    }

    #[test]
    fn test_ngram_similar_texts_rank_higher() {
        let embedder = NgramEmbedder::new(384);
        let base = embedder.embed("Acme evaluating new CRM platform vendors").unwrap();
        let near = embedder.embed("Acme is evaluating new CRM platform vendors this quarter").unwrap();
        let far = embedder.embed("Quarterly dividend announced for shareholders").unwrap();
        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
    }

    #[test]
    fn test_ngram_normalizes_case_and_width() {
        let embedder = NgramEmbedder::new(64);
        let a = embedder.embed("ＣＲＭ  Rollout").unwrap();
        let b = embedder.embed("crm rollout").unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_ngram_empty_text_is_zero_vector() {
        let embedder = NgramEmbedder::new(16);
        let v = embedder.embed("   ").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_cosine_guards_mismatched_and_zero_vectors() {
        let unit = [0.6_f32, 0.8];
        assert!((cosine_similarity(&unit, &unit) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&unit, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&unit, &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_select_strategy_defaults_to_ngram() {
        let strategy = select_strategy(&ClusteringConfig::default());
        assert_eq!(strategy.name(), "ngram");
        assert_eq!(strategy.dimension(), 384);
    }

    #[test]
    fn test_mean_embedding_normalized() {
        let a = [1.0_f32, 0.0];
        let b = [0.0_f32, 1.0];
        let m = mean_embedding(&[&a, &b]);
        let norm = m.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((m[0] - m[1]).abs() < 1e-6);
    }

    #[test]
    fn test_mean_embedding_skips_other_dimensions() {
        let a = [3.0_f32, 4.0];
        let stray = [100.0_f32, 0.0, 0.0];
        let m = mean_embedding(&[&a, &stray]);
        assert_eq!(m.len(), 2);
        assert!((m[0] - 0.6).abs() < 1e-6);
        assert!((m[1] - 0.8).abs() < 1e-6);
        assert!(mean_embedding(&[]).is_empty());
    }
}
