//! Per-alias ranking cache with single-writer refresh
//!
//! Cached generations are short-lived. Reads serve the cached generation
//! until it passes the staleness threshold; recomputation for one alias is
//! serialized on a per-alias lock so at most one generation is ever in
//! flight, and duplicate refresh requests collapse instead of queueing.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::identity::UserAlias;
use crate::models::RankingRecord;
use crate::pagination::MAX_LIMIT;
use crate::store::Store;

use super::engine::{RankingEngine, RankingRequest};

#[derive(Clone)]
struct CachedGeneration {
    records: Vec<RankingRecord>,
    generated_at: DateTime<Utc>,
}

struct Inner {
    engine: RankingEngine,
    store: Arc<dyn Store>,
    staleness: Duration,
    generations: DashMap<UserAlias, CachedGeneration>,
    refresh_locks: DashMap<UserAlias, Arc<Mutex<()>>>,
}

/// Caching front of the ranking engine. Cheap to clone.
#[derive(Clone)]
pub struct RankingService {
    inner: Arc<Inner>,
}

impl RankingService {
    /// Wrap an engine with the per-alias cache
    pub fn new(engine: RankingEngine, store: Arc<dyn Store>, staleness_secs: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                store,
                staleness: Duration::seconds(staleness_secs.min(i64::MAX as u64) as i64),
                generations: DashMap::new(),
                refresh_locks: DashMap::new(),
            }),
        }
    }

    /// Serve rankings for a request.
    ///
    /// Plain requests are answered from the cached generation (computing
    /// one lazily when missing or stale); parameterized requests run the
    /// pipeline directly since their composition is caller-specific.
    pub async fn rankings_for(&self, request: &RankingRequest) -> Result<Vec<RankingRecord>> {
        if !Self::is_plain(request) {
            return self.generate_with_fallback(request).await;
        }

        if let Some(generation) = self.fresh_generation(&request.alias) {
            return Ok(Self::narrow(generation.records, request));
        }

        let lock = self.refresh_lock(&request.alias);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited on the lock.
        if let Some(generation) = self.fresh_generation(&request.alias) {
            return Ok(Self::narrow(generation.records, request));
        }

        let full = RankingRequest::plain(request.alias.clone(), MAX_LIMIT);
        let records = self.generate_with_fallback(&full).await?;
        self.store_generation(&request.alias, &records);
        Ok(Self::narrow(records, request))
    }

    /// Background refresh. Returns `false` when a refresh for the alias was
    /// already in flight (the duplicate collapses).
    pub async fn refresh(&self, alias: &UserAlias) -> Result<bool> {
        let lock = self.refresh_lock(alias);
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(alias = %alias, "ranking refresh already in flight; collapsing");
            return Ok(false);
        };

        let request = RankingRequest::plain(alias.clone(), MAX_LIMIT);
        let records = self.inner.engine.generate(&request).await?;
        self.store_generation(alias, &records);
        Ok(true)
    }

    /// Drop the cached generation (interaction side effect)
    pub fn invalidate(&self, alias: &UserAlias) {
        self.inner.generations.remove(alias);
    }

    /// Whether the alias's cached generation is missing or past staleness
    pub fn is_stale(&self, alias: &UserAlias) -> bool {
        self.fresh_generation(alias).is_none()
    }

    fn is_plain(request: &RankingRequest) -> bool {
        request.exclude.is_empty()
            && request.languages.is_none()
            && request.model_id.is_none()
            && !request.diversity
    }

    fn fresh_generation(&self, alias: &UserAlias) -> Option<CachedGeneration> {
        let generation = self.inner.generations.get(alias)?;
        if Utc::now().signed_duration_since(generation.generated_at) > self.inner.staleness {
            return None;
        }
        Some(generation.clone())
    }

    fn refresh_lock(&self, alias: &UserAlias) -> Arc<Mutex<()>> {
        self.inner
            .refresh_locks
            .entry(alias.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn store_generation(&self, alias: &UserAlias, records: &[RankingRecord]) {
        // Anonymous cold-start output varies per call; caching it would pin
        // one arbitrary page for every anonymous caller.
        if alias.is_anonymous() {
            return;
        }
        let generated_at = records
            .first()
            .map(|r| r.generated_at)
            .unwrap_or_else(Utc::now);
        self.inner.generations.insert(
            alias.clone(),
            CachedGeneration {
                records: records.to_vec(),
                generated_at,
            },
        );
    }

    fn narrow(records: Vec<RankingRecord>, request: &RankingRequest) -> Vec<RankingRecord> {
        records
            .into_iter()
            .filter(|r| r.score >= request.min_score)
            .take(request.limit)
            .collect()
    }

    /// Run the pipeline; on `ranking_unavailable` fall back to the last
    /// persisted generation when one exists.
    async fn generate_with_fallback(
        &self,
        request: &RankingRequest,
    ) -> Result<Vec<RankingRecord>> {
        match self.inner.engine.generate(request).await {
            Ok(records) => Ok(records),
            Err(Error::RankingUnavailable(msg)) => {
                match self.inner.store.rankings_for_alias(&request.alias).await {
                    Ok(persisted) if !persisted.is_empty() => {
                        tracing::warn!(
                            alias = %request.alias,
                            error = %msg,
                            "serving last persisted rankings"
                        );
                        Ok(Self::narrow(persisted, request))
                    }
                    _ => Err(Error::RankingUnavailable(msg)),
                }
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crawler::optout::OptOutCache;
    use crate::models::{
        DiscoveryMeta, DiscoverySource, EngagementCounts, InteractionAction, NewInteraction, Post,
        PostKey,
    };
    use crate::store::memory::MemoryStore;

    fn service_over(store: Arc<MemoryStore>, staleness_secs: u64) -> RankingService {
        let config = Arc::new(Config::default());
        let optout = Arc::new(OptOutCache::new(&config.crawler));
        let engine = RankingEngine::new(store.clone(), config, optout);
        RankingService::new(engine, store, staleness_secs)
    }

    fn post(id: &str, favs: u64) -> Post {
        let now = Utc::now();
        Post {
            key: PostKey::new("mastodon.social", id),
            author: format!("{id}@mastodon.social"),
            content: String::new(),
            created_at: now - Duration::hours(1),
            language: Some("en".to_string()),
            language_confidence: None,
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

    async fn seed_history(store: &MemoryStore, alias: &UserAlias) {
        store
            .append_interaction(&NewInteraction {
                alias: alias.clone(),
                post_key: PostKey::new("mastodon.social", "p1"),
                action: InteractionAction::Favorite,
                context: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn plain_requests_reuse_the_cached_generation() {
        let store = Arc::new(MemoryStore::new());
        store.seed_post(post("p1", 10));
        store.seed_post(post("p2", 8));
        let alias = UserAlias::from_raw("alice");
        seed_history(&store, &alias).await;

        let service = service_over(store, 300);

        let first = service
            .rankings_for(&RankingRequest::plain(alias.clone(), 10))
            .await
            .unwrap();
        let second = service
            .rankings_for(&RankingRequest::plain(alias.clone(), 10))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(!service.is_stale(&alias));
    }

    #[tokio::test]
    async fn invalidation_marks_the_generation_stale() {
        let store = Arc::new(MemoryStore::new());
        store.seed_post(post("p1", 10));
        let alias = UserAlias::from_raw("alice");
        seed_history(&store, &alias).await;

        let service = service_over(store, 300);
        service
            .rankings_for(&RankingRequest::plain(alias.clone(), 10))
            .await
            .unwrap();
        assert!(!service.is_stale(&alias));

        service.invalidate(&alias);
        assert!(service.is_stale(&alias));
    }

    #[tokio::test]
    async fn refresh_collapses_while_in_flight() {
        let store = Arc::new(MemoryStore::new());
        store.seed_post(post("p1", 10));
        let alias = UserAlias::from_raw("alice");
        seed_history(&store, &alias).await;

        let service = service_over(store, 300);
        let lock = service.refresh_lock(&alias);
        let guard = lock.lock().await;

        // A refresh while the lock is held collapses instead of queueing.
        assert!(!service.refresh(&alias).await.unwrap());
        drop(guard);
        assert!(service.refresh(&alias).await.unwrap());
    }
}
