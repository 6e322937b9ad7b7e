//! Cold-start selection: trending over the crawled corpus
//!
//! Serves alias-free, new, and language-mismatched calls, and supplies the
//! trending/serendipity slices of diversity injection. Selection falls
//! through a ladder: strict engagement threshold, relaxed, any recent
//! corpus, embedded seed list, logging each boundary it crosses.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};

use crate::config::{ColdStartConfig, RankingConfig};
use crate::models::{
    DiscoveryMeta, DiscoverySource, Post, PostKey, ReasonCategory, SYNTHETIC_INSTANCE,
};

/// A post with its presentation score and attribution
#[derive(Debug, Clone)]
pub struct ScoredPost {
    /// The post itself
    pub post: Post,
    /// Score in [0,1]
    pub score: f64,
    /// Why it was selected
    pub reason_category: ReasonCategory,
    /// Specific token where applicable
    pub reason_detail: Option<String>,
}

/// Signals describing an alias's usual neighborhood, used to pick content
/// from outside it
#[derive(Debug, Clone, Default)]
pub struct UserSignals {
    /// Instances the alias usually engages with
    pub instances: HashSet<String>,
    /// Hashtags the alias usually engages with
    pub tags: HashSet<String>,
    /// Authors the alias usually engages with
    pub authors: HashSet<String>,
}

impl UserSignals {
    /// Whether a post sits outside every known signal
    pub fn is_outside(&self, post: &Post) -> bool {
        !self.instances.contains(&post.key.instance)
            && !self.authors.contains(&post.author)
            && !post.tags.iter().any(|t| self.tags.contains(t))
    }
}

/// Apply per-author and per-instance caps to a score-descending list
pub fn apply_caps(posts: Vec<ScoredPost>, per_author: usize, per_instance: usize) -> Vec<ScoredPost> {
    let mut author_counts: HashMap<String, usize> = HashMap::new();
    let mut instance_counts: HashMap<String, usize> = HashMap::new();
    let mut kept = Vec::with_capacity(posts.len());

    for scored in posts {
        let by_author = author_counts.entry(scored.post.author.clone()).or_insert(0);
        let by_instance = instance_counts
            .entry(scored.post.key.instance.clone())
            .or_insert(0);
        if *by_author >= per_author || *by_instance >= per_instance {
            continue;
        }
        *by_author += 1;
        *by_instance += 1;
        kept.push(scored);
    }
    kept
}

/// Trending selection with the fallback ladder. `corpus` should already be
/// recent posts; opted-out authors are excluded at every tier except the
/// embedded seeds.
pub fn select(
    corpus: &[Post],
    languages: Option<&[String]>,
    is_opted_out: &dyn Fn(&str) -> bool,
    coldstart: &ColdStartConfig,
    ranking: &RankingConfig,
    limit: usize,
    now: DateTime<Utc>,
) -> Vec<ScoredPost> {
    if limit == 0 {
        return Vec::new();
    }

    let eligible: Vec<&Post> = corpus
        .iter()
        .filter(|p| !is_opted_out(&p.author))
        .filter(|p| matches_languages(p, languages))
        .collect();

    let strict: Vec<&Post> = eligible
        .iter()
        .copied()
        .filter(|p| p.engagement.weighted() >= coldstart.engagement_threshold)
        .collect();

    let pool: Vec<&Post> = if !strict.is_empty() {
        strict
    } else {
        let relaxed: Vec<&Post> = eligible
            .iter()
            .copied()
            .filter(|p| p.engagement.weighted() > 0.0)
            .collect();
        if !relaxed.is_empty() {
            tracing::info!(
                pool = relaxed.len(),
                "cold-start fallback: relaxed engagement threshold"
            );
            relaxed
        } else if !eligible.is_empty() {
            tracing::info!(pool = eligible.len(), "cold-start fallback: any recent corpus");
            eligible
        } else {
            tracing::info!("cold-start fallback: embedded seed list");
            return seed_posts()
                .into_iter()
                .take(limit)
                .map(|post| ScoredPost {
                    post,
                    score: 0.0,
                    reason_category: ReasonCategory::Trending,
                    reason_detail: None,
                })
                .collect();
        }
    };

    let scored = rank_by_trending(&pool, now);
    let capped = apply_caps(scored, ranking.per_author_cap, ranking.per_instance_cap);
    capped.into_iter().take(limit).collect()
}

/// Score a pool by trending, normalized to [0,1] by the pool maximum
pub fn rank_by_trending(pool: &[&Post], now: DateTime<Utc>) -> Vec<ScoredPost> {
    let max_trending = pool
        .iter()
        .map(|p| p.trending_score(now))
        .fold(0.0_f64, f64::max);

    let mut scored: Vec<ScoredPost> = pool
        .iter()
        .map(|post| {
            let raw = post.trending_score(now);
            let score = if max_trending > 0.0 { raw / max_trending } else { 0.0 };
            ScoredPost {
                post: (*post).clone(),
                score,
                reason_category: ReasonCategory::Trending,
                reason_detail: post.tags.first().cloned(),
            }
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// How a `limit` splits into top-ranked / outside / serendipitous slices
pub fn diversity_counts(limit: usize, config: &ColdStartConfig) -> (usize, usize, usize) {
    if limit == 0 {
        return (0, 0, 0);
    }
    let outside = ((limit as f64) * config.outside_share).round() as usize;
    let serendipity =
        ((limit as f64) * (1.0 - config.top_share - config.outside_share)).round() as usize;
    let outside = outside.min(limit);
    let serendipity = serendipity.min(limit - outside);
    (limit - outside - serendipity, outside, serendipity)
}

/// Diversity interleave: 70% top-ranked, 20% trending outside the alias's
/// network, 10% serendipitous picks from the top tercile of trending.
/// Shortfalls in either diversity slice backfill from the ranked list.
pub fn diversity_mix(
    ranked: Vec<ScoredPost>,
    trending: &[ScoredPost],
    signals: &UserSignals,
    limit: usize,
    config: &ColdStartConfig,
    rng: &mut impl Rng,
) -> Vec<ScoredPost> {
    let (top_n, outside_n, serendipity_n) = diversity_counts(limit, config);

    let mut taken: HashSet<PostKey> = HashSet::new();
    let mut top: Vec<ScoredPost> = Vec::with_capacity(top_n);
    for scored in &ranked {
        if top.len() >= top_n {
            break;
        }
        if taken.insert(scored.post.key.clone()) {
            top.push(scored.clone());
        }
    }

    let mut outside: Vec<ScoredPost> = Vec::with_capacity(outside_n);
    for scored in trending {
        if outside.len() >= outside_n {
            break;
        }
        if signals.is_outside(&scored.post) && taken.insert(scored.post.key.clone()) {
            let mut pick = scored.clone();
            pick.reason_category = ReasonCategory::Trending;
            outside.push(pick);
        }
    }

    // Serendipity samples uniformly from the top tercile by trending score,
    // still excluding the alias's typical signals.
    let tercile = (trending.len() / 3).max(1).min(trending.len());
    let candidates: Vec<&ScoredPost> = trending[..tercile]
        .iter()
        .filter(|s| signals.is_outside(&s.post) && !taken.contains(&s.post.key))
        .collect();
    let mut serendipity: Vec<ScoredPost> = Vec::with_capacity(serendipity_n);
    let mut indexes: Vec<usize> = (0..candidates.len()).collect();
    let sample_n = serendipity_n.min(indexes.len());
    for i in 0..sample_n {
        let j = rng.random_range(i..indexes.len());
        indexes.swap(i, j);
        let mut pick = candidates[indexes[i]].clone();
        pick.reason_category = ReasonCategory::Serendipity;
        taken.insert(pick.post.key.clone());
        serendipity.push(pick);
    }

    // Interleave the diversity slices evenly through the top-ranked run.
    let mut extras: Vec<ScoredPost> = outside.into_iter().chain(serendipity).collect();
    let mut merged: Vec<ScoredPost> = Vec::with_capacity(limit);
    if extras.is_empty() {
        merged = top;
    } else {
        let stride = (top.len() / extras.len()).max(1);
        let mut top_iter = top.into_iter();
        loop {
            let mut emitted = false;
            for _ in 0..stride {
                if let Some(item) = top_iter.next() {
                    merged.push(item);
                    emitted = true;
                }
            }
            if !extras.is_empty() {
                merged.push(extras.remove(0));
                emitted = true;
            }
            if !emitted {
                break;
            }
        }
    }

    // Backfill from the remaining ranked items when slices came up short.
    if merged.len() < limit {
        for scored in ranked {
            if merged.len() >= limit {
                break;
            }
            if taken.insert(scored.post.key.clone()) {
                merged.push(scored);
            }
        }
    }

    merged.truncate(limit);
    merged
}

/// Minimal embedded seed list so a fresh install has something to serve
pub fn seed_posts() -> Vec<Post> {
    let discovered_at = Utc::now();
    let seed = |id: &str, content: &str, tags: &[&str]| Post {
        key: PostKey::new(SYNTHETIC_INSTANCE, id),
        author: format!("corgi@{SYNTHETIC_INSTANCE}"),
        content: content.to_string(),
        created_at: discovered_at,
        language: Some("en".to_string()),
        language_confidence: Some(1.0),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        engagement: Default::default(),
        media: vec![],
        discovery: DiscoveryMeta {
            source: DiscoverySource::Timeline,
            discovered_at,
            reason: "seed".to_string(),
        },
    };

    vec![
        seed(
            "seed-welcome",
            "<p>Welcome! Recommendations warm up as the crawler discovers posts \
             and you interact with your timeline.</p>",
            &["welcome"],
        ),
        seed(
            "seed-fediverse",
            "<p>Follow hashtags you care about: the recommender learns from \
             favourites, boosts, and replies.</p>",
            &["fediverse", "tips"],
        ),
        seed(
            "seed-privacy",
            "<p>Your interactions are stored under a salted pseudonymous alias, \
             never your account id.</p>",
            &["privacy"],
        ),
    ]
}

fn matches_languages(post: &Post, languages: Option<&[String]>) -> bool {
    match languages {
        None => true,
        Some(filter) => match &post.language {
            Some(lang) => filter.iter().any(|l| l == lang),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EngagementCounts;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn post(id: &str, instance: &str, author: &str, lang: &str, favs: u64, hours_old: i64) -> Post {
        let now = Utc::now();
        Post {
            key: PostKey::new(instance, id),
            author: author.to_string(),
            content: format!("<p>{id}</p>"),
            created_at: now - chrono::Duration::hours(hours_old),
            language: Some(lang.to_string()),
            language_confidence: Some(0.9),
            tags: vec![],
            engagement: EngagementCounts { favourites: favs, reblogs: 0, replies: 0 },
            media: vec![],
            discovery: DiscoveryMeta {
                source: DiscoverySource::Timeline,
                discovered_at: now,
                reason: "public".to_string(),
            },
        }
    }

    fn never_opted_out(_: &str) -> bool {
        false
    }

    #[test]
    fn language_filter_selects_only_matching_posts() {
        let corpus: Vec<Post> = (0..3)
            .map(|i| post(&format!("es{i}"), "m.s", &format!("a{i}@m.s"), "es", 10, 1))
            .chain((0..7).map(|i| post(&format!("en{i}"), "m.s", &format!("b{i}@m.s"), "en", 10, 1)))
            .collect();

        let langs = vec!["es".to_string()];
        let selected = select(
            &corpus,
            Some(&langs),
            &never_opted_out,
            &ColdStartConfig::default(),
            &RankingConfig::default(),
            20,
            Utc::now(),
        );
        assert_eq!(selected.len(), 3);
        assert!(selected.iter().all(|s| s.post.language.as_deref() == Some("es")));
    }

    #[test]
    fn trending_orders_descending_and_normalizes() {
        let corpus = vec![
            post("low", "m.s", "a@m.s", "en", 6, 1),
            post("high", "m.s", "b@m.s", "en", 50, 1),
        ];
        let selected = select(
            &corpus,
            None,
            &never_opted_out,
            &ColdStartConfig::default(),
            &RankingConfig::default(),
            10,
            Utc::now(),
        );
        assert_eq!(selected[0].post.key.post_id, "high");
        assert!((selected[0].score - 1.0).abs() < 1e-9);
        assert!(selected[1].score < 1.0);
    }

    #[test]
    fn fallback_ladder_ends_at_seeds() {
        let selected = select(
            &[],
            None,
            &never_opted_out,
            &ColdStartConfig::default(),
            &RankingConfig::default(),
            5,
            Utc::now(),
        );
        assert!(!selected.is_empty());
        assert!(selected
            .iter()
            .all(|s| s.post.key.instance == SYNTHETIC_INSTANCE));
    }

    #[test]
    fn relaxed_tier_admits_low_engagement() {
        // Everything is below the strict threshold but has some engagement.
        let corpus = vec![post("a", "m.s", "a@m.s", "en", 1, 1)];
        let selected = select(
            &corpus,
            None,
            &never_opted_out,
            &ColdStartConfig::default(),
            &RankingConfig::default(),
            5,
            Utc::now(),
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].post.key.post_id, "a");
    }

    #[test]
    fn opted_out_authors_are_excluded() {
        let corpus = vec![
            post("a", "m.s", "optout@m.s", "en", 50, 1),
            post("b", "m.s", "fine@m.s", "en", 10, 1),
        ];
        let opted = |author: &str| author == "optout@m.s";
        let selected = select(
            &corpus,
            None,
            &opted,
            &ColdStartConfig::default(),
            &RankingConfig::default(),
            10,
            Utc::now(),
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].post.author, "fine@m.s");
    }

    #[test]
    fn per_author_and_per_instance_caps() {
        let mut corpus = Vec::new();
        for i in 0..10 {
            corpus.push(post(&format!("p{i}"), "m.s", "same@m.s", "en", 10, 1));
        }
        let ranking = RankingConfig {
            per_author_cap: 3,
            per_instance_cap: 10,
            ..RankingConfig::default()
        };
        let selected = select(
            &corpus,
            None,
            &never_opted_out,
            &ColdStartConfig::default(),
            &ranking,
            10,
            Utc::now(),
        );
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn diversity_counts_split_70_20_10() {
        let config = ColdStartConfig::default();
        assert_eq!(diversity_counts(10, &config), (7, 2, 1));
        assert_eq!(diversity_counts(20, &config), (14, 4, 2));
        assert_eq!(diversity_counts(0, &config), (0, 0, 0));
    }

    #[test]
    fn diversity_mix_pulls_from_outside_the_network() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = ColdStartConfig::default();

        let ranked: Vec<ScoredPost> = (0..10)
            .map(|i| ScoredPost {
                post: post(&format!("r{i}"), "home.social", &format!("r{i}@home.social"), "en", 5, 1),
                score: 1.0 - i as f64 * 0.05,
                reason_category: ReasonCategory::AuthorAffinity,
                reason_detail: None,
            })
            .collect();

        let trending: Vec<ScoredPost> = (0..10)
            .map(|i| ScoredPost {
                post: post(&format!("t{i}"), "other.social", &format!("t{i}@other.social"), "en", 20, 1),
                score: 1.0 - i as f64 * 0.05,
                reason_category: ReasonCategory::Trending,
                reason_detail: None,
            })
            .collect();

        let mut signals = UserSignals::default();
        signals.instances.insert("home.social".to_string());

        let mixed = diversity_mix(ranked, &trending, &signals, 10, &config, &mut rng);
        assert_eq!(mixed.len(), 10);

        let outside = mixed
            .iter()
            .filter(|s| s.post.key.instance == "other.social")
            .count();
        assert_eq!(outside, 3); // 2 trending-outside + 1 serendipity
        assert!(mixed
            .iter()
            .any(|s| s.reason_category == ReasonCategory::Serendipity));

        // No duplicates across slices.
        let mut keys: Vec<String> = mixed.iter().map(|s| s.post.key.to_string()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 10);
    }
}
