//! Per-candidate scoring: sub-scores, normalization, reason attribution
//!
//! Every sub-score is normalized to [0,1] before weighting; the final score
//! is a weighted sum clipped to [0,1]. Engagement normalization is the
//! `log_clip` strategy (ln(1+x) scaled by the candidate-pool maximum); the
//! strategy name travels in the model configuration so operators can see
//! which normalization a model ran with.

use std::collections::HashSet;

use crate::config::{ModelConfig, ModelWeights};
use crate::models::{Post, ReasonCategory};

/// The four sub-scores of one candidate, each in [0,1]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    /// Smoothed positive-interaction ratio with the author
    pub author_affinity: f64,
    /// Pool-normalized engagement
    pub engagement: f64,
    /// Exponential freshness decay
    pub recency: f64,
    /// Language/tag overlap with recent positive interactions
    pub content_affinity: f64,
}

impl ScoreBreakdown {
    /// Weighted sum, clipped to [0,1]
    pub fn total(&self, weights: &ModelWeights) -> f64 {
        let raw = self.author_affinity * weights.author_affinity
            + self.engagement * weights.engagement
            + self.recency * weights.recency
            + self.content_affinity * weights.content_affinity;
        raw.clamp(0.0, 1.0)
    }

    /// The largest-contributing sub-score names the reason category
    pub fn dominant(&self, weights: &ModelWeights) -> ReasonCategory {
        let contributions = [
            (
                ReasonCategory::AuthorAffinity,
                self.author_affinity * weights.author_affinity,
            ),
            (ReasonCategory::Engagement, self.engagement * weights.engagement),
            (ReasonCategory::Recency, self.recency * weights.recency),
            (
                ReasonCategory::ContentAffinity,
                self.content_affinity * weights.content_affinity,
            ),
        ];
        contributions
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(category, _)| category)
            .unwrap_or(ReasonCategory::Recency)
    }

    /// Whether any component failed to produce a finite value
    pub fn is_finite(&self) -> bool {
        self.author_affinity.is_finite()
            && self.engagement.is_finite()
            && self.recency.is_finite()
            && self.content_affinity.is_finite()
    }
}

/// `log_clip` engagement normalization: ln(1+x) over the pool maximum
pub fn normalize_engagement(weighted: f64, pool_max_weighted: f64) -> f64 {
    if pool_max_weighted <= 0.0 {
        return 0.0;
    }
    let denominator = (1.0 + pool_max_weighted).ln();
    if denominator <= 0.0 {
        return 0.0;
    }
    ((1.0 + weighted.max(0.0)).ln() / denominator).clamp(0.0, 1.0)
}

/// Exponential decay with the model's half-life
pub fn recency_score(age_hours: f64, half_life_hours: f64) -> f64 {
    if half_life_hours <= 0.0 {
        return 0.0;
    }
    0.5_f64.powf(age_hours.max(0.0) / half_life_hours).clamp(0.0, 1.0)
}

/// Languages and tags drawn from an alias's recent positive interactions
#[derive(Debug, Clone, Default)]
pub struct ContentProfile {
    /// Language tags seen on positively-engaged posts
    pub languages: HashSet<String>,
    /// Hashtags seen on positively-engaged posts
    pub tags: HashSet<String>,
}

impl ContentProfile {
    /// Whether the profile holds no signal at all
    pub fn is_empty(&self) -> bool {
        self.languages.is_empty() && self.tags.is_empty()
    }
}

/// Overlap between a candidate and the profile: half a point for a
/// language match, half for tag overlap (shared tags over candidate tags).
pub fn content_affinity(post: &Post, profile: &ContentProfile) -> f64 {
    if profile.is_empty() {
        return 0.0;
    }

    let language_match = match &post.language {
        Some(lang) if profile.languages.contains(lang) => 1.0,
        _ => 0.0,
    };

    let tag_overlap = if post.tags.is_empty() {
        0.0
    } else {
        let shared = post.tags.iter().filter(|t| profile.tags.contains(*t)).count();
        shared as f64 / post.tags.len() as f64
    };

    (0.5 * language_match + 0.5 * tag_overlap).clamp(0.0, 1.0)
}

/// The first candidate tag shared with the profile, for reason detail
pub fn shared_tag(post: &Post, profile: &ContentProfile) -> Option<String> {
    post.tags.iter().find(|t| profile.tags.contains(*t)).cloned()
}

/// Score one candidate against the model
pub fn score_candidate(
    post: &Post,
    affinity: f64,
    pool_max_weighted: f64,
    age_hours: f64,
    profile: &ContentProfile,
    model: &ModelConfig,
) -> ScoreBreakdown {
    ScoreBreakdown {
        author_affinity: affinity.clamp(0.0, 1.0),
        engagement: normalize_engagement(post.engagement.weighted(), pool_max_weighted),
        recency: recency_score(age_hours, model.half_life_hours),
        content_affinity: content_affinity(post, profile),
    }
}
