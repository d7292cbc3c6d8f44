//! Learned channel reliability.
//!
//! Each channel a binding has used carries attempts/successes. Reliability is
//! modelled as Beta(1 + successes, 1 + failures): the mean gives a stable
//! estimate, a Thompson sample trades exploitation for exploration.

use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::config::ChannelExploration;
use crate::types::ChannelStats;

/// Weight of the static ROI table in the effective ROI; the rest is learned.
const BASE_ROI_WEIGHT: f64 = 0.5;

/// Thompson draws are kept off the extremes so one lucky draw cannot pin a
/// channel's ROI to 0 or 1.
const SAMPLE_FLOOR: f64 = 0.01;
const SAMPLE_CEILING: f64 = 0.99;

/// Beta posterior over a channel's hit rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelPosterior {
    pub alpha: f64,
    pub beta: f64,
}

impl ChannelPosterior {
    /// Uniform prior updated with the channel's record.
    pub fn from_stats(stats: Option<&ChannelStats>) -> Self {
        let (hits, misses) = stats
            .map(|s| (s.successes as f64, s.failures() as f64))
            .unwrap_or_default();
        Self {
            alpha: 1.0 + hits,
            beta: 1.0 + misses,
        }
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match Beta::new(self.alpha, self.beta) {
            Ok(dist) => dist.sample(rng).clamp(SAMPLE_FLOOR, SAMPLE_CEILING),
            Err(e) => {
                log::debug!("Reliability: Beta({}, {}) rejected ({}), using mean", self.alpha, self.beta, e);
                self.mean()
            }
        }
    }
}

/// Reliability of a channel given what the binding has seen on it.
/// Unseen channels sit at the uniform prior (0.5 under `Mean`).
pub fn channel_reliability(stats: Option<&ChannelStats>, mode: ChannelExploration) -> f64 {
    let posterior = ChannelPosterior::from_stats(stats);
    match mode {
        ChannelExploration::Mean => posterior.mean(),
        ChannelExploration::Thompson => posterior.sample(&mut rand::rng()),
    }
}

/// Blend the static channel ROI with learned reliability.
pub fn effective_roi(base_roi: f64, reliability: f64) -> f64 {
    BASE_ROI_WEIGHT * base_roi + (1.0 - BASE_ROI_WEIGHT) * reliability
}
