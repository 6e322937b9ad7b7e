//! The ranking pipeline: candidate selection, pre-aggregation, scoring,
//! diversity, persistence
//!
//! Pre-aggregation is the historically hot path: the alias's entire
//! interaction history is fetched in one query and every author lookup runs
//! as a bulk fetch chunked under the IN-clause limit. Per-candidate store
//! calls are a regression, not a style choice.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::Config;
use crate::crawler::optout::OptOutCache;
use crate::error::{Error, Result};
use crate::identity::UserAlias;
use crate::models::{self, Post, PostKey, RankingRecord, ReasonCategory};
use crate::store::Store;

use super::coldstart::{self, ScoredPost, UserSignals};
use super::scoring::{self, ContentProfile};

/// Most interactions considered per alias in one pipeline run
const INTERACTION_HISTORY_CAP: usize = 5000;

/// Bound on the co-engagement neighborhood
const PEER_ALIAS_CAP: usize = 50;
const PEER_POST_CAP: usize = 500;

/// Inputs of one ranking run
#[derive(Debug, Clone)]
pub struct RankingRequest {
    /// Alias to rank for
    pub alias: UserAlias,
    /// Maximum records to produce
    pub limit: usize,
    /// Drop records scoring below this
    pub min_score: f64,
    /// Posts the caller already has
    pub exclude: Vec<PostKey>,
    /// Language filter
    pub languages: Option<Vec<String>>,
    /// Scoring model; unknown or absent selects the default model
    pub model_id: Option<String>,
    /// Apply the 70/20/10 diversity interleave
    pub diversity: bool,
}

impl RankingRequest {
    /// A run with default knobs
    pub fn plain(alias: UserAlias, limit: usize) -> Self {
        Self {
            alias,
            limit,
            min_score: 0.0,
            exclude: Vec::new(),
            languages: None,
            model_id: None,
            diversity: false,
        }
    }
}

/// The ranking pipeline
pub struct RankingEngine {
    store: Arc<dyn Store>,
    config: Arc<Config>,
    optout: Arc<OptOutCache>,
}

impl RankingEngine {
    /// Assemble the engine over its collaborators
    pub fn new(store: Arc<dyn Store>, config: Arc<Config>, optout: Arc<OptOutCache>) -> Self {
        Self {
            store,
            config,
            optout,
        }
    }

    /// Run the pipeline and persist the generation.
    ///
    /// Anonymous aliases and aliases without history delegate to cold-start
    /// (nothing is persisted for those runs). Store failures at
    /// pre-aggregation or persistence surface as `ranking_unavailable`.
    pub async fn generate(&self, request: &RankingRequest) -> Result<Vec<RankingRecord>> {
        let now = Utc::now();

        if request.alias.is_anonymous() {
            return self.cold_start_records(request, now).await;
        }

        // Pre-aggregation: the whole history in one query, then one bulk
        // post fetch to recover authors, tags, and languages.
        let history = self
            .store
            .interactions_for_alias(&request.alias, INTERACTION_HISTORY_CAP)
            .await
            .map_err(|e| Error::RankingUnavailable(format!("history fetch: {e}")))?;

        if history.is_empty() {
            return self.cold_start_records(request, now).await;
        }

        let mut history_keys: Vec<PostKey> = Vec::new();
        let mut seen_keys: HashSet<PostKey> = HashSet::new();
        for record in &history {
            if seen_keys.insert(record.post_key.clone()) {
                history_keys.push(record.post_key.clone());
            }
        }

        let history_posts = self
            .store
            .get_posts(&history_keys)
            .await
            .map_err(|e| Error::RankingUnavailable(format!("history hydration: {e}")))?;

        let author_of: HashMap<PostKey, String> = history_posts
            .iter()
            .map(|p| (p.key.clone(), p.author.clone()))
            .collect();

        let views_are_positive = self.config.ranking.views_are_positive;
        let affinity = models::author_affinity(&history, &author_of, views_are_positive);

        let mut profile = ContentProfile::default();
        let mut signals = UserSignals::default();
        let positive_keys: HashSet<&PostKey> = history
            .iter()
            .filter(|i| i.action.is_positive(views_are_positive))
            .map(|i| &i.post_key)
            .collect();
        for post in &history_posts {
            signals.instances.insert(post.key.instance.clone());
            signals.authors.insert(post.author.clone());
            for tag in &post.tags {
                signals.tags.insert(tag.clone());
            }
            if positive_keys.contains(&post.key) {
                if let Some(lang) = &post.language {
                    profile.languages.insert(lang.clone());
                }
                for tag in &post.tags {
                    profile.tags.insert(tag.clone());
                }
            }
        }

        // Candidate selection: recent corpus, the co-engagement
        // neighborhood, and positively-engaged authors.
        let since = now - Duration::days(self.config.ranking.candidate_days);
        let candidates = self
            .collect_candidates(request, &affinity, since, now)
            .await;

        if candidates.is_empty() {
            return self.cold_start_records(request, now).await;
        }

        // Scoring is pure and in-memory from here.
        let model = self.config.ranking.model(request.model_id.as_deref());
        let pool_max_weighted = candidates
            .iter()
            .map(|p| p.engagement.weighted())
            .fold(0.0_f64, f64::max);

        let mut scored: Vec<ScoredPost> = Vec::with_capacity(candidates.len());
        for post in candidates {
            let author_score = affinity
                .get(&post.author)
                .map(|a| a.score(model.smoothing_alpha))
                .unwrap_or(0.0);
            let age_hours =
                (now.signed_duration_since(post.created_at).num_minutes() as f64) / 60.0;

            let breakdown = scoring::score_candidate(
                &post,
                author_score,
                pool_max_weighted,
                age_hours,
                &profile,
                &model,
            );
            if !breakdown.is_finite() {
                tracing::warn!(post = %post.key, "non-finite sub-score; candidate dropped");
                continue;
            }

            let reason_category = breakdown.dominant(&model.weights);
            let reason_detail = match reason_category {
                ReasonCategory::AuthorAffinity => Some(post.author.clone()),
                ReasonCategory::ContentAffinity => {
                    scoring::shared_tag(&post, &profile).or_else(|| post.tags.first().cloned())
                }
                _ => post.tags.first().cloned(),
            };

            scored.push(ScoredPost {
                score: breakdown.total(&model.weights),
                post,
                reason_category,
                reason_detail,
            });
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.retain(|s| s.score >= request.min_score);
        let mut selected = coldstart::apply_caps(
            scored,
            self.config.ranking.per_author_cap,
            self.config.ranking.per_instance_cap,
        );

        if request.diversity {
            let trending = self.trending_pool(request, since, now).await;
            selected = coldstart::diversity_mix(
                selected,
                &trending,
                &signals,
                request.limit,
                &self.config.coldstart,
                &mut rand::rng(),
            );
        }
        selected.truncate(request.limit);

        let records = to_records(&request.alias, selected, now);

        self.store
            .replace_rankings(&request.alias, &records)
            .await
            .map_err(|e| Error::RankingUnavailable(format!("persistence: {e}")))?;

        Ok(records)
    }

    /// The three candidate sources merged, deduplicated, filtered, capped.
    /// A failing source degrades to an empty contribution.
    async fn collect_candidates(
        &self,
        request: &RankingRequest,
        affinity: &HashMap<String, models::AuthorAffinity>,
        since: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Vec<Post> {
        let cap = self.config.ranking.candidate_cap;

        let recent = match self.store.recent_posts(since, cap).await {
            Ok(posts) => posts,
            Err(e) => {
                tracing::warn!(error = %e, "recent-posts candidate source failed");
                Vec::new()
            }
        };

        let engaged_authors: Vec<String> = affinity.keys().cloned().collect();

        let peer_posts = match self
            .store
            .aliases_interacting_with_authors(&engaged_authors, since, PEER_ALIAS_CAP)
            .await
        {
            Ok(mut peers) => {
                peers.retain(|a| a != &request.alias);
                if peers.is_empty() {
                    Vec::new()
                } else {
                    match self.store.posts_engaged_by(&peers, since, PEER_POST_CAP).await {
                        Ok(keys) => self.store.get_posts(&keys).await.unwrap_or_else(|e| {
                            tracing::warn!(error = %e, "peer-post hydration failed");
                            Vec::new()
                        }),
                        Err(e) => {
                            tracing::warn!(error = %e, "co-engagement candidate source failed");
                            Vec::new()
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "peer discovery failed");
                Vec::new()
            }
        };

        let positive_authors: Vec<String> = affinity
            .iter()
            .filter(|(_, a)| a.positive > 0)
            .map(|(author, _)| author.clone())
            .collect();
        let followed_posts = if positive_authors.is_empty() {
            Vec::new()
        } else {
            self.store
                .posts_by_authors(&positive_authors, since, PEER_POST_CAP)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "author candidate source failed");
                    Vec::new()
                })
        };

        let excluded: HashSet<&PostKey> = request.exclude.iter().collect();
        let mut seen: HashSet<PostKey> = HashSet::new();
        let mut merged: Vec<Post> = Vec::new();
        for post in recent.into_iter().chain(peer_posts).chain(followed_posts) {
            if merged.len() >= cap {
                break;
            }
            if excluded.contains(&post.key) || !seen.insert(post.key.clone()) {
                continue;
            }
            if self.optout.is_opted_out_cached(&post.author) {
                continue;
            }
            if let Some(languages) = &request.languages {
                match &post.language {
                    Some(lang) if languages.contains(lang) => {}
                    _ => continue,
                }
            }
            merged.push(post);
        }
        merged
    }

    /// Trending pool for the diversity slices
    async fn trending_pool(
        &self,
        request: &RankingRequest,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<ScoredPost> {
        let corpus = match self
            .store
            .recent_posts(since, self.config.ranking.candidate_cap)
            .await
        {
            Ok(posts) => posts,
            Err(e) => {
                tracing::warn!(error = %e, "trending pool fetch failed");
                return Vec::new();
            }
        };

        let excluded: HashSet<&PostKey> = request.exclude.iter().collect();
        let pool: Vec<&Post> = corpus
            .iter()
            .filter(|p| !excluded.contains(&p.key))
            .filter(|p| !self.optout.is_opted_out_cached(&p.author))
            .collect();
        coldstart::rank_by_trending(&pool, now)
    }

    /// Cold-start path: trending selection over the recent corpus with the
    /// fallback ladder. A store failure here degrades to the seed list
    /// rather than erroring.
    async fn cold_start_records(
        &self,
        request: &RankingRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankingRecord>> {
        let since = now - Duration::days(self.config.ranking.candidate_days);
        let corpus = match self
            .store
            .recent_posts(since, self.config.ranking.candidate_cap)
            .await
        {
            Ok(posts) => posts,
            Err(e) => {
                tracing::warn!(error = %e, "cold-start corpus fetch failed; using seeds");
                Vec::new()
            }
        };

        let excluded: HashSet<&PostKey> = request.exclude.iter().collect();
        let corpus: Vec<Post> = corpus
            .into_iter()
            .filter(|p| !excluded.contains(&p.key))
            .collect();

        let optout = self.optout.clone();
        let is_opted_out = move |author: &str| optout.is_opted_out_cached(author);

        let mut selected = coldstart::select(
            &corpus,
            request.languages.as_deref(),
            &is_opted_out,
            &self.config.coldstart,
            &self.config.ranking,
            request.limit,
            now,
        );
        selected.retain(|s| s.score >= request.min_score);

        Ok(to_records(&request.alias, selected, now))
    }
}

/// Convert selections into one generation of ranking records. Every record
/// shares `generated_at` and post keys are unique.
fn to_records(alias: &UserAlias, selected: Vec<ScoredPost>, generated_at: DateTime<Utc>) -> Vec<RankingRecord> {
    let mut seen: HashSet<PostKey> = HashSet::new();
    selected
        .into_iter()
        .filter(|s| seen.insert(s.post.key.clone()))
        .map(|s| RankingRecord {
            alias: alias.clone(),
            post_key: s.post.key,
            score: s.score.clamp(0.0, 1.0),
            reason_category: s.reason_category,
            reason_detail: s.reason_detail,
            generated_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DiscoveryMeta, DiscoverySource, EngagementCounts, InteractionAction, NewInteraction,
    };
    use crate::store::memory::MemoryStore;

    fn engine_over(store: Arc<MemoryStore>) -> RankingEngine {
        let config = Arc::new(Config::default());
        let optout = Arc::new(OptOutCache::new(&config.crawler));
        RankingEngine::new(store, config, optout)
    }

    fn post(id: &str, author: &str, favs: u64, hours_old: i64) -> Post {
        let now = Utc::now();
        Post {
            key: PostKey::new("mastodon.social", id),
            author: author.to_string(),
            content: format!("<p>{id}</p>"),
            created_at: now - Duration::hours(hours_old),
            language: Some("en".to_string()),
            language_confidence: Some(0.9),
            tags: vec!["rust".to_string()],
            engagement: EngagementCounts { favourites: favs, reblogs: 0, replies: 0 },
            media: vec![],
            discovery: DiscoveryMeta {
                source: DiscoverySource::Timeline,
                discovered_at: now,
                reason: "public".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn anonymous_delegates_to_cold_start() {
        let store = Arc::new(MemoryStore::new());
        store.seed_post(post("1", "a@mastodon.social", 10, 1));
        store.seed_post(post("2", "b@mastodon.social", 5, 1));

        let engine = engine_over(store);
        let records = engine
            .generate(&RankingRequest::plain(UserAlias::anonymous(), 10))
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.reason_category == ReasonCategory::Trending));
        // Anonymous runs are not persisted.
        let persisted = engine
            .store
            .rankings_for_alias(&UserAlias::anonymous())
            .await
            .unwrap();
        assert!(persisted.is_empty());
    }

    #[tokio::test]
    async fn generation_is_unique_bounded_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let alias = UserAlias::from_raw("alice");

        for i in 0..30 {
            store.seed_post(post(&format!("p{i}"), &format!("author{}@mastodon.social", i % 10), 5, 2));
        }
        // History so the personal path runs.
        store
            .append_interaction(&NewInteraction {
                alias: alias.clone(),
                post_key: PostKey::new("mastodon.social", "p0"),
                action: InteractionAction::Favorite,
                context: None,
            })
            .await
            .unwrap();

        let engine = engine_over(store.clone());
        let records = engine
            .generate(&RankingRequest::plain(alias.clone(), 10))
            .await
            .unwrap();

        assert!(records.len() <= 10);
        let generated_at = records[0].generated_at;
        assert!(records.iter().all(|r| r.generated_at == generated_at));

        let mut keys: Vec<String> = records.iter().map(|r| r.post_key.to_string()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), records.len());

        assert!(records.iter().all(|r| (0.0..=1.0).contains(&r.score)));

        let persisted = store.rankings_for_alias(&alias).await.unwrap();
        assert_eq!(persisted.len(), records.len());
    }

    #[tokio::test]
    async fn exclusions_and_author_affinity_reason() {
        let store = Arc::new(MemoryStore::new());
        let alias = UserAlias::from_raw("alice");

        // Heavy positive history with one author.
        store.seed_post(post("liked", "fav@mastodon.social", 1, 2));
        for _ in 0..5 {
            store
                .append_interaction(&NewInteraction {
                    alias: alias.clone(),
                    post_key: PostKey::new("mastodon.social", "liked"),
                    action: InteractionAction::Favorite,
                    context: None,
                })
                .await
                .unwrap();
        }
        store.seed_post(post("fresh-by-fav", "fav@mastodon.social", 0, 1));
        store.seed_post(post("other", "other@mastodon.social", 0, 1));

        let engine = engine_over(store);
        let mut request = RankingRequest::plain(alias.clone(), 10);
        request.exclude = vec![PostKey::new("mastodon.social", "liked")];
        let records = engine.generate(&request).await.unwrap();

        assert!(records.iter().all(|r| r.post_key.post_id != "liked"));
        let by_fav = records
            .iter()
            .find(|r| r.post_key.post_id == "fresh-by-fav")
            .expect("favored author's fresh post is a candidate");
        assert_eq!(by_fav.reason_category, ReasonCategory::AuthorAffinity);
        assert_eq!(by_fav.reason_detail.as_deref(), Some("fav@mastodon.social"));
    }

    #[tokio::test]
    async fn empty_candidate_pool_falls_back_to_cold_start() {
        let store = Arc::new(MemoryStore::new());
        let alias = UserAlias::from_raw("alice");
        // History references a post the sweep already removed; corpus empty.
        store
            .append_interaction(&NewInteraction {
                alias: alias.clone(),
                post_key: PostKey::new("mastodon.social", "gone"),
                action: InteractionAction::Favorite,
                context: None,
            })
            .await
            .unwrap();

        let engine = engine_over(store);
        let records = engine
            .generate(&RankingRequest::plain(alias, 5))
            .await
            .unwrap();
        // Seed-list fallback, never an error.
        assert!(!records.is_empty());
    }

    #[tokio::test]
    async fn min_score_filters_records() {
        let store = Arc::new(MemoryStore::new());
        store.seed_post(post("1", "a@mastodon.social", 10, 1));

        let engine = engine_over(store);
        let mut request = RankingRequest::plain(UserAlias::anonymous(), 10);
        request.min_score = 0.99;
        let records = engine.generate(&request).await.unwrap();
        assert!(records.iter().all(|r| r.score >= 0.99));
    }
}
