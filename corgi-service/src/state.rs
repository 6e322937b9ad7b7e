//! Shared application state

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheService;
use crate::config::Config;
use crate::crawler::{Crawler, OptOutCache};
use crate::error::Result;
use crate::jobs::{JobContext, JobRunner, JobsHandle};
use crate::middleware::RateLimiter;
use crate::proxy::UpstreamClient;
use crate::ranking::{RankingEngine, RankingService};
use crate::store::{self, Store};

/// Application state shared across handlers. Every field is behind an Arc
/// (or is internally Arc'd), so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    cache: CacheService,
    upstream: UpstreamClient,
    rankings: RankingService,
    limiter: Arc<RateLimiter>,
    optout: Arc<OptOutCache>,
    crawler: Arc<Crawler>,
    jobs: JobsHandle,
}

impl AppState {
    /// Wire the full object graph: store, caches, clients, services, and
    /// the background job queue. Returns the runner alongside the state so
    /// the binary decides when workers start.
    pub async fn build(config: Config, shutdown: CancellationToken) -> Result<(Self, JobRunner)> {
        let config = Arc::new(config);
        let store = store::connect(&config).await?;
        let cache = CacheService::new(config.cache.clone(), config.redis.as_ref()).await?;
        let upstream = UpstreamClient::new(&config.upstream)?;
        let optout = Arc::new(OptOutCache::new(&config.crawler));

        let engine = RankingEngine::new(store.clone(), config.clone(), optout.clone());
        let rankings = RankingService::new(engine, store.clone(), config.ranking.staleness_secs);

        let crawler = Arc::new(Crawler::new(
            store.clone(),
            config.clone(),
            upstream.clone(),
            optout.clone(),
        ));

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        let (jobs, runner) = crate::jobs::channel(
            JobContext {
                rankings: rankings.clone(),
                crawler: crawler.clone(),
                config: config.clone(),
            },
            shutdown,
        );

        let state = Self {
            config,
            store,
            cache,
            upstream,
            rankings,
            limiter,
            optout,
            crawler,
            jobs,
        };
        Ok((state, runner))
    }

    /// Frozen configuration
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Persistence backend
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Response cache
    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    /// Upstream HTTP client
    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// Ranking service
    pub fn rankings(&self) -> &RankingService {
        &self.rankings
    }

    /// Rate limiter
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Opt-out cache
    pub fn optout(&self) -> &Arc<OptOutCache> {
        &self.optout
    }

    /// Crawler (readiness reporting)
    pub fn crawler(&self) -> &Arc<Crawler> {
        &self.crawler
    }

    /// Background job queue
    pub fn jobs(&self) -> &JobsHandle {
        &self.jobs
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::StoreBackendKind;

    /// State over the in-memory backend, for handler tests. The returned
    /// runner is dropped by most tests; enqueues then drop harmlessly.
    pub(crate) async fn memory_state(mut config: Config) -> (AppState, JobRunner) {
        config.store.backend = StoreBackendKind::Memory;
        config.redis = None;
        AppState::build(config, CancellationToken::new())
            .await
            .expect("memory state builds")
    }
}
