//! Content crawler: polite, concurrent discovery across upstream instances
//!
//! One cooperative task per instance per cycle; instances crawl in parallel
//! while requests within an instance stay strictly sequential behind a floor
//! delay. Upstream rate-limit signals back the crawler off with jitter, and
//! repeated hard failures park the instance in cool-down via the health
//! registry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::canonical_instance;
use crate::models::{
    DiscoveryMeta, DiscoverySource, EngagementCounts, MediaDescriptor, Post, PostKey,
};
use crate::proxy::{UpstreamClient, UpstreamResponse};
use crate::store::Store;

pub mod health;
pub mod language;
pub mod optout;

pub use health::{HealthRegistry, InstanceHealth};
pub use optout::OptOutCache;

/// Most engagement-discovered authors followed per instance per cycle
const AUTHOR_SOURCE_CAP: usize = 5;

/// Outcome of one instance crawl
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlStats {
    /// Statuses seen across all sources
    pub fetched: usize,
    /// Statuses upserted into the corpus
    pub upserted: usize,
    /// Statuses dropped because their author opted out
    pub skipped_opt_out: usize,
}

/// The crawler and its instance-scoped state
pub struct Crawler {
    store: Arc<dyn Store>,
    config: Arc<Config>,
    client: UpstreamClient,
    optout: Arc<OptOutCache>,
    health: HealthRegistry,
}

impl Crawler {
    /// Assemble the crawler over its collaborators
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<Config>,
        client: UpstreamClient,
        optout: Arc<OptOutCache>,
    ) -> Self {
        let health = HealthRegistry::new(&config.crawler);
        Self {
            store,
            config,
            client,
            optout,
            health,
        }
    }

    /// Health registry (readiness reporting)
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Crawl every configured instance concurrently; one task per instance
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Vec<(String, CrawlStats)> {
        let instances: Vec<String> = self
            .config
            .crawler
            .instances
            .iter()
            .map(|i| canonical_instance(i))
            .collect();

        let tasks = instances.iter().map(|instance| {
            let cancel = cancel.clone();
            async move {
                let stats = match self.crawl_instance(instance, &cancel).await {
                    Ok(stats) => stats,
                    Err(e) => {
                        tracing::warn!(instance, error = %e, "instance crawl aborted");
                        CrawlStats::default()
                    }
                };
                (instance.clone(), stats)
            }
        });

        futures::future::join_all(tasks).await
    }

    /// Crawl one instance: public timelines above the watermark, the
    /// configured hashtag set, and engagement-discovered authors.
    pub async fn crawl_instance(
        &self,
        instance: &str,
        cancel: &CancellationToken,
    ) -> Result<CrawlStats> {
        if !self.health.is_healthy(instance) {
            tracing::debug!(instance, "skipping unhealthy instance");
            return Ok(CrawlStats::default());
        }

        let mut stats = CrawlStats::default();
        let page_limit = self.config.crawler.page_limit;

        let mut sources: Vec<(String, String)> = vec![
            (
                "timeline-public".to_string(),
                format!("/api/v1/timelines/public?limit={page_limit}"),
            ),
            (
                "timeline-local".to_string(),
                format!("/api/v1/timelines/public?local=true&limit={page_limit}"),
            ),
        ];
        for tag in &self.config.crawler.hashtags {
            sources.push((
                format!("hashtag:{tag}"),
                format!("/api/v1/timelines/tag/{tag}?limit={page_limit}"),
            ));
        }

        let mut first_request = true;
        for (source, base_path) in sources {
            if cancel.is_cancelled() {
                return Ok(stats);
            }

            let watermark = self
                .store
                .watermark(instance, &source)
                .await
                .unwrap_or_default();
            let path = match &watermark {
                Some(id) => format!("{base_path}&since_id={id}"),
                None => base_path,
            };

            let discovery = if source.starts_with("hashtag:") {
                (DiscoverySource::Hashtag, source.trim_start_matches("hashtag:").to_string())
            } else {
                (DiscoverySource::Timeline, source.clone())
            };

            match self
                .paced_get(instance, &path, &mut first_request, cancel)
                .await
            {
                Ok(response) => {
                    let page = match response.json() {
                        Ok(Value::Array(items)) => items,
                        _ => {
                            tracing::debug!(instance, source = %source, "non-array page");
                            continue;
                        }
                    };
                    let max_id = self
                        .process_page(instance, &page, discovery.0, &discovery.1, &mut stats)
                        .await;
                    if let Some(max_id) = max_id {
                        if watermark
                            .as_deref()
                            .map(|w| id_newer(&max_id, w))
                            .unwrap_or(true)
                        {
                            if let Err(e) =
                                self.store.set_watermark(instance, &source, &max_id).await
                            {
                                tracing::warn!(instance, error = %e, "watermark update failed");
                            }
                        }
                    }
                }
                Err(Error::Timeout) | Err(Error::Upstream { .. }) => {
                    if self.health.record_failure(instance) {
                        return Ok(stats);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Engagement-discovered authors: follow the most engaged-with
        // authors of this instance's recent corpus back to their own feeds.
        let authors = self.engaged_authors(instance).await;
        for author in authors.into_iter().take(AUTHOR_SOURCE_CAP) {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self
                .crawl_author(instance, &author, &mut first_request, cancel, &mut stats)
                .await
            {
                tracing::debug!(instance, author, error = %e, "author crawl failed");
                if self.health.record_failure(instance) {
                    break;
                }
            }
        }

        tracing::info!(
            instance,
            fetched = stats.fetched,
            upserted = stats.upserted,
            skipped_opt_out = stats.skipped_opt_out,
            "crawl cycle finished"
        );
        Ok(stats)
    }

    /// Lifecycle sweep: expire stale posts, drop opted-out authors' posts,
    /// and compact the opt-out cache.
    pub async fn lifecycle_sweep(&self) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.crawler.freshness_days);
        let swept = self.store.sweep_posts(cutoff, cutoff).await?;

        let opted_out = self.optout.opted_out_authors();
        let dropped = if opted_out.is_empty() {
            0
        } else {
            self.store.delete_posts_by_authors(&opted_out).await?
        };

        self.optout.sweep_expired();

        tracing::info!(swept, dropped_opt_out = dropped, "lifecycle sweep finished");
        Ok(swept + dropped)
    }

    async fn crawl_author(
        &self,
        instance: &str,
        author: &str,
        first_request: &mut bool,
        cancel: &CancellationToken,
        stats: &mut CrawlStats,
    ) -> Result<()> {
        let (username, author_instance) = author.split_once('@').unwrap_or((author, instance));

        let lookup = self
            .paced_get(
                author_instance,
                &format!("/api/v1/accounts/lookup?acct={username}"),
                first_request,
                cancel,
            )
            .await?;
        if lookup.status != 200 {
            return Ok(());
        }
        let account = lookup.json()?;
        self.optout.observe_account(author, &account);
        if self.optout.is_opted_out_cached(author) {
            stats.skipped_opt_out += 1;
            return Ok(());
        }

        let Some(account_id) = account.get("id").and_then(Value::as_str) else {
            return Ok(());
        };

        let statuses = self
            .paced_get(
                author_instance,
                &format!(
                    "/api/v1/accounts/{account_id}/statuses?limit={}",
                    self.config.crawler.page_limit
                ),
                first_request,
                cancel,
            )
            .await?;
        if statuses.status != 200 {
            return Ok(());
        }
        if let Ok(Value::Array(items)) = statuses.json() {
            self.process_page(
                author_instance,
                &items,
                DiscoverySource::Account,
                author,
                stats,
            )
            .await;
        }
        Ok(())
    }

    /// One paced, health-aware GET. Applies the inter-request floor delay
    /// and exponential backoff with jitter after failures; honors upstream
    /// `Retry-After` on 429.
    async fn paced_get(
        &self,
        instance: &str,
        path: &str,
        first_request: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse> {
        if !*first_request {
            let floor = Duration::from_millis(self.config.crawler.min_request_delay_ms);
            let jitter = Duration::from_millis(rand::rng().random_range(0..=250));
            tokio::select! {
                _ = tokio::time::sleep(floor + jitter) => {}
                _ = cancel.cancelled() => return Err(Error::Timeout),
            }
        }
        *first_request = false;

        let response = self.client.get_json(instance, path, None).await?;

        if response.status == 429 || response.status >= 500 {
            let failures = self.health.snapshot(instance).consecutive_failures;
            let backoff = backoff_delay(
                self.config.crawler.min_request_delay_ms,
                failures,
                response.retry_after,
            );
            tracing::warn!(
                instance,
                status = response.status,
                backoff_ms = backoff.as_millis() as u64,
                "upstream throttling crawl"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(Error::Timeout),
            }
            return Err(Error::Upstream {
                status: response.status,
                message: "crawl request rejected".to_string(),
            });
        }

        self.health.record_success(instance);
        Ok(response)
    }

    /// Parse, opt-out-check, and upsert one page of statuses. Returns the
    /// highest status id seen for watermark advancement.
    async fn process_page(
        &self,
        instance: &str,
        page: &[Value],
        source: DiscoverySource,
        reason: &str,
        stats: &mut CrawlStats,
    ) -> Option<String> {
        let now = Utc::now();
        let mut max_id: Option<String> = None;

        for status in page {
            stats.fetched += 1;

            let Some(post) = parse_status(status, instance, source, reason, now) else {
                continue;
            };

            if let Some(id) = status.get("id").and_then(Value::as_str) {
                if max_id.as_deref().map(|m| id_newer(id, m)).unwrap_or(true) {
                    max_id = Some(id.to_string());
                }
            }

            if let Some(account) = status.get("account") {
                self.optout.observe_account(&post.author, account);
            }
            let opted_out = match self.optout.cached(&post.author) {
                Some(state) => state,
                None => self.optout.check(&post.author, &self.client).await,
            };
            if opted_out {
                stats.skipped_opt_out += 1;
                continue;
            }

            match self.store.upsert_post(&post).await {
                Ok(()) => stats.upserted += 1,
                Err(e) => tracing::warn!(post = %post.key, error = %e, "corpus upsert failed"),
            }
        }

        max_id
    }

    /// Authors of this instance's most engaged-with recent posts
    async fn engaged_authors(&self, instance: &str) -> Vec<String> {
        let since = Utc::now() - ChronoDuration::days(self.config.crawler.freshness_days);
        let mut posts = match self.store.recent_posts(since, 200).await {
            Ok(posts) => posts,
            Err(e) => {
                tracing::debug!(error = %e, "engaged-author discovery failed");
                return Vec::new();
            }
        };
        posts.retain(|p| p.key.instance == instance && p.engagement.weighted() > 0.0);
        posts.sort_by(|a, b| {
            b.engagement
                .weighted()
                .partial_cmp(&a.engagement.weighted())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut authors = Vec::new();
        for post in posts {
            if !authors.contains(&post.author) {
                authors.push(post.author);
            }
            if authors.len() >= AUTHOR_SOURCE_CAP {
                break;
            }
        }
        authors
    }
}

/// Backoff with jitter; upstream `Retry-After` wins when present
fn backoff_delay(base_ms: u64, failures: u32, retry_after: Option<u64>) -> Duration {
    if let Some(secs) = retry_after {
        return Duration::from_secs(secs.min(300));
    }
    let base = base_ms.max(100);
    let exp = base.saturating_mul(2u64.saturating_pow(failures.min(6)));
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(exp.min(60_000) + jitter)
}

/// Numeric-aware id comparison: Mastodon snowflakes compare numerically,
/// anything else lexicographically
fn id_newer(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u128>(), current.parse::<u128>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => candidate > current,
    }
}

/// Convert an upstream status object into a corpus post. Returns `None`
/// for statuses missing the fields the corpus requires.
pub fn parse_status(
    status: &Value,
    instance: &str,
    source: DiscoverySource,
    reason: &str,
    now: DateTime<Utc>,
) -> Option<Post> {
    let id = status.get("id").and_then(Value::as_str)?;
    let content = status.get("content").and_then(Value::as_str)?;

    let acct = status
        .get("account")
        .and_then(|a| a.get("acct"))
        .and_then(Value::as_str)?;
    let author = if acct.contains('@') {
        acct.to_string()
    } else {
        format!("{acct}@{instance}")
    };

    let created_at = status
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);

    let tags: Vec<String> = status
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(|t| t.to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default();

    let media: Vec<MediaDescriptor> = status
        .get("media_attachments")
        .and_then(Value::as_array)
        .map(|attachments| {
            attachments
                .iter()
                .filter_map(|m| {
                    Some(MediaDescriptor {
                        kind: m.get("type").and_then(Value::as_str)?.to_string(),
                        url: m.get("url").and_then(Value::as_str)?.to_string(),
                        description: m
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let count = |key: &str| {
        status
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or_default()
    };

    let (language, confidence) = language::detect(content);
    let (language, language_confidence) = if language == language::UNKNOWN {
        // Short posts defer to the language upstream claims, at reduced
        // confidence.
        match status.get("language").and_then(Value::as_str) {
            Some(upstream_lang) => (Some(upstream_lang.to_ascii_lowercase()), Some(0.5)),
            None => (None, None),
        }
    } else {
        (Some(language), Some(confidence))
    };

    Some(Post {
        key: PostKey::new(instance, id),
        author,
        content: content.to_string(),
        created_at,
        language,
        language_confidence,
        tags,
        engagement: EngagementCounts {
            favourites: count("favourites_count"),
            reblogs: count("reblogs_count"),
            replies: count("replies_count"),
        },
        media,
        discovery: DiscoveryMeta {
            source,
            discovered_at: now,
            reason: reason.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(id: &str, acct: &str) -> Value {
        json!({
            "id": id,
            "content": "<p>The quick brown fox jumps over the lazy dog this morning.</p>",
            "created_at": "2026-07-01T12:00:00Z",
            "language": "en",
            "account": {"acct": acct, "note": ""},
            "favourites_count": 3,
            "reblogs_count": 1,
            "replies_count": 0,
            "tags": [{"name": "Foxes"}],
            "media_attachments": [],
        })
    }

    #[test]
    fn parses_statuses_and_normalizes_authors() {
        let now = Utc::now();
        let post = parse_status(
            &status("123", "ada"),
            "mastodon.social",
            DiscoverySource::Timeline,
            "timeline-public",
            now,
        )
        .unwrap();

        assert_eq!(post.key, PostKey::new("mastodon.social", "123"));
        assert_eq!(post.author, "ada@mastodon.social");
        assert_eq!(post.language.as_deref(), Some("en"));
        assert_eq!(post.tags, vec!["foxes".to_string()]);
        assert_eq!(post.engagement.favourites, 3);
        assert_eq!(post.discovery.reason, "timeline-public");

        // Remote authors keep their instance.
        let post = parse_status(
            &status("124", "grace@fosstodon.org"),
            "mastodon.social",
            DiscoverySource::Timeline,
            "timeline-public",
            now,
        )
        .unwrap();
        assert_eq!(post.author, "grace@fosstodon.org");
    }

    #[test]
    fn statuses_missing_required_fields_are_skipped() {
        let now = Utc::now();
        assert!(parse_status(
            &json!({"content": "x"}),
            "m.s",
            DiscoverySource::Timeline,
            "t",
            now
        )
        .is_none());
        assert!(parse_status(
            &json!({"id": "1", "content": "x"}),
            "m.s",
            DiscoverySource::Timeline,
            "t",
            now
        )
        .is_none());
    }

    #[test]
    fn id_comparison_is_numeric_for_snowflakes() {
        assert!(id_newer("100", "99"));
        assert!(!id_newer("99", "100"));
        assert!(id_newer("b", "a"));
    }

    #[tokio::test]
    async fn sweep_drops_posts_by_opted_out_authors() {
        use crate::config::Config;
        use crate::store::memory::MemoryStore;
        use crate::store::Store;
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(Config::default());
        let optout = Arc::new(OptOutCache::new(&config.crawler));
        let client = crate::proxy::UpstreamClient::new(&config.upstream).unwrap();
        let crawler = Crawler::new(store.clone(), config, client, optout.clone());

        let now = Utc::now();
        for (id, author) in [("1", "out@m.s"), ("2", "out@m.s"), ("3", "in@m.s")] {
            store.seed_post(Post {
                key: PostKey::new("mastodon.social", id),
                author: author.to_string(),
                content: String::new(),
                created_at: now,
                language: None,
                language_confidence: None,
                tags: vec![],
                engagement: EngagementCounts::default(),
                media: vec![],
                discovery: DiscoveryMeta {
                    source: DiscoverySource::Timeline,
                    discovered_at: now,
                    reason: "public".to_string(),
                },
            });
        }

        // Opt-out observed mid-crawl: the author's existing posts become
        // ineligible at the next sweep.
        optout.observe_account("out@m.s", &json!({"note": "#nobots"}));
        let removed = crawler.lifecycle_sweep().await.unwrap();
        assert_eq!(removed, 2);

        let remaining = store
            .recent_posts(now - ChronoDuration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].author, "in@m.s");
    }

    #[test]
    fn backoff_honors_retry_after_and_grows() {
        assert_eq!(backoff_delay(1000, 0, Some(7)), Duration::from_secs(7));
        let first = backoff_delay(1000, 0, None);
        let third = backoff_delay(1000, 2, None);
        assert!(first >= Duration::from_millis(1000));
        assert!(third >= Duration::from_millis(4000));
        // Bounded even under many failures.
        assert!(backoff_delay(1000, 30, None) <= Duration::from_millis(60_500));
    }
}
