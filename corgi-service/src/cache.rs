//! Two-tier response cache with fingerprint keys and content-class TTLs
//!
//! An in-process tier serves hot reads; an optional Redis tier shares
//! entries across processes. Cache failures never surface to callers:
//! read and write errors are logged and behave as misses.

use dashmap::DashMap;
use deadpool_redis::{Config as DeadpoolConfig, Pool as RedisPool, Runtime};
use serde::{Deserialize, Serialize};
use std::ops::DerefMut;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{CacheConfig, RedisConfig};
use crate::error::{Error, Result};
use crate::identity::UserAlias;
use crate::models::PostKey;

/// Content classes carrying distinct TTLs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    /// Home and recommended timelines
    Timeline,
    /// User profiles
    Profile,
    /// Instance metadata
    Instance,
    /// Individual statuses
    Status,
    /// Everything else cacheable
    Default,
}

impl ContentClass {
    /// TTL for this class under the given configuration
    pub fn ttl(&self, config: &CacheConfig) -> Duration {
        let secs = match self {
            Self::Timeline => config.timeline_ttl_secs,
            Self::Profile => config.profile_ttl_secs,
            Self::Instance => config.instance_ttl_secs,
            Self::Status => config.status_ttl_secs,
            Self::Default => config.default_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

/// A cached upstream (or locally composed) response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// HTTP status (always 200 under the write policy)
    pub status: u16,
    /// Content type of the body
    pub content_type: String,
    /// Raw body bytes
    pub body: Vec<u8>,
    /// `Link` header to replay with the body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Compute a cache fingerprint.
///
/// The fingerprint is a keyed-input BLAKE3 hash (collision-resistant; fast
/// non-cryptographic hashes are forbidden for keys that cross trust
/// boundaries) of the cache-relevant request features. User-scoped entries
/// include the alias, public entries do not; the alias scope is kept as a
/// key prefix so one alias's entries can be dropped without touching
/// anyone else's.
pub fn fingerprint(
    endpoint_class: &str,
    method: &str,
    path: &str,
    relevant_params: &[(String, String)],
    alias: Option<&UserAlias>,
    instance: &str,
) -> String {
    let scope = match alias {
        Some(alias) => alias.as_str(),
        None => "public",
    };

    let mut params: Vec<&(String, String)> = relevant_params.iter().collect();
    params.sort();

    let mut hasher = blake3::Hasher::new();
    for part in [endpoint_class, method, path] {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    for (name, value) in params {
        hasher.update(name.as_bytes());
        hasher.update(&[0x1e]);
        hasher.update(value.as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.update(scope.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(instance.as_bytes());

    format!("corgi:cache:{}:{}", scope, hasher.finalize().to_hex())
}

/// Cache key for a post's engagement counters
pub fn engagement_key(key: &PostKey) -> String {
    format!("corgi:engagement:{}", key)
}

struct LocalEntry {
    expires_at: Instant,
    response: CachedResponse,
}

struct CacheInner {
    config: CacheConfig,
    local: DashMap<String, LocalEntry>,
    redis: Option<RedisPool>,
}

/// Two-tier cache service. Cheap to clone.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<CacheInner>,
}

impl CacheService {
    /// Build the cache, connecting the Redis tier when configured.
    /// Redis connection failure degrades to the in-process tier alone.
    pub async fn new(config: CacheConfig, redis: Option<&RedisConfig>) -> Result<Self> {
        let pool = match redis {
            Some(redis_config) => match create_redis_pool(redis_config).await {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable; in-process cache only");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                local: DashMap::new(),
                redis: pool,
            }),
        })
    }

    /// In-process-only cache (tests)
    pub fn in_process(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                local: DashMap::new(),
                redis: None,
            }),
        }
    }

    /// Whether the shared tier is attached
    pub fn has_shared_tier(&self) -> bool {
        self.inner.redis.is_some()
    }

    /// Look up an entry. Errors in either tier degrade to a miss.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        if let Some(entry) = self.inner.local.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.response.clone());
            }
        }
        // Expired local entries are dropped lazily.
        self.inner
            .local
            .remove_if(key, |_, e| e.expires_at <= Instant::now());

        let pool = self.inner.redis.as_ref()?;
        match redis_get(pool, key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Store an entry under its content-class TTL. Never fails.
    pub async fn put(&self, key: &str, class: ContentClass, response: CachedResponse) {
        let ttl = class.ttl(&self.inner.config);
        self.evict_if_full();
        self.inner.local.insert(
            key.to_string(),
            LocalEntry {
                expires_at: Instant::now() + ttl,
                response: response.clone(),
            },
        );

        if let Some(pool) = self.inner.redis.as_ref() {
            if let Err(e) = redis_put(pool, key, ttl, &response).await {
                tracing::warn!(error = %e, "cache write failed; entry is local only");
            }
        }
    }

    /// Drop one key from both tiers
    pub async fn invalidate(&self, key: &str) {
        self.inner.local.remove(key);
        if let Some(pool) = self.inner.redis.as_ref() {
            if let Err(e) = redis_del(pool, key).await {
                tracing::warn!(error = %e, "cache invalidation failed");
            }
        }
    }

    /// Drop every entry scoped to one alias
    pub async fn invalidate_alias(&self, alias: &UserAlias) {
        let prefix = format!("corgi:cache:{}:", alias.as_str());
        self.inner.local.retain(|key, _| !key.starts_with(&prefix));

        if let Some(pool) = self.inner.redis.as_ref() {
            if let Err(e) = redis_del_prefix(pool, &prefix).await {
                tracing::warn!(error = %e, "alias cache invalidation failed");
            }
        }
    }

    /// Drop a post's engagement-counter entry
    pub async fn invalidate_engagement(&self, key: &PostKey) {
        self.invalidate(&engagement_key(key)).await;
    }

    fn evict_if_full(&self) {
        let capacity = self.inner.config.local_capacity;
        if self.inner.local.len() < capacity {
            return;
        }
        let now = Instant::now();
        self.inner.local.retain(|_, e| e.expires_at > now);
        if self.inner.local.len() >= capacity {
            // Still saturated with live entries; shed an arbitrary slice.
            let excess = self.inner.local.len() - capacity + capacity / 10;
            let victims: Vec<String> = self
                .inner
                .local
                .iter()
                .take(excess)
                .map(|e| e.key().clone())
                .collect();
            for key in victims {
                self.inner.local.remove(&key);
            }
        }
    }
}

async fn create_redis_pool(config: &RedisConfig) -> Result<RedisPool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_redis_pool(config).await {
            Ok(pool) => {
                tracing::info!(
                    "Redis cache tier connected: max_connections={}",
                    config.max_connections
                );
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    return Err(e);
                }
                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "Redis connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_redis_pool(config: &RedisConfig) -> Result<RedisPool> {
    let cfg = DeadpoolConfig::from_url(&config.url);
    let pool = cfg
        .builder()
        .map_err(|e| Error::Internal(format!("Failed to build Redis pool: {}", e)))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create Redis pool: {}", e)))?;

    let conn = pool
        .get()
        .await
        .map_err(|e| Error::Internal(format!("Failed to get Redis connection: {}", e)))?;
    drop(conn);

    Ok(pool)
}

async fn redis_get(pool: &RedisPool, key: &str) -> Result<Option<CachedResponse>> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    let raw: Option<Vec<u8>> = redis::cmd("GET")
        .arg(key)
        .query_async(conn.deref_mut())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    match raw {
        Some(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        None => Ok(None),
    }
}

async fn redis_put(
    pool: &RedisPool,
    key: &str,
    ttl: Duration,
    response: &CachedResponse,
) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    let bytes = serde_json::to_vec(response).map_err(|e| Error::Internal(e.to_string()))?;
    let _: () = redis::cmd("SETEX")
        .arg(key)
        .arg(ttl.as_secs().max(1))
        .arg(bytes)
        .query_async(conn.deref_mut())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    Ok(())
}

async fn redis_del(pool: &RedisPool, key: &str) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    let _: () = redis::cmd("DEL")
        .arg(key)
        .query_async(conn.deref_mut())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    Ok(())
}

async fn redis_del_prefix(pool: &RedisPool, prefix: &str) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    let pattern = format!("{}*", prefix);
    let mut cursor: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(conn.deref_mut())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        if !keys.is_empty() {
            let _: () = redis::cmd("DEL")
                .arg(&keys)
                .query_async(conn.deref_mut())
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn response() -> CachedResponse {
        CachedResponse {
            status: 200,
            content_type: "application/json".to_string(),
            body: b"[]".to_vec(),
            link: None,
        }
    }

    #[test]
    fn fingerprint_is_stable_under_param_permutation() {
        let a = fingerprint(
            "timeline",
            "GET",
            "/api/v1/timelines/home",
            &params(&[("limit", "20"), ("max_id", "5")]),
            None,
            "mastodon.social",
        );
        let b = fingerprint(
            "timeline",
            "GET",
            "/api/v1/timelines/home",
            &params(&[("max_id", "5"), ("limit", "20")]),
            None,
            "mastodon.social",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_separates_aliases() {
        let alice = UserAlias::from_raw("alice-alias");
        let bob = UserAlias::from_raw("bob-alias");
        let p = params(&[("limit", "20")]);

        let a = fingerprint("timeline", "GET", "/t", &p, Some(&alice), "m.s");
        let b = fingerprint("timeline", "GET", "/t", &p, Some(&bob), "m.s");
        let public = fingerprint("timeline", "GET", "/t", &p, None, "m.s");

        assert_ne!(a, b);
        assert_ne!(a, public);
        assert!(a.starts_with("corgi:cache:alice-alias:"));
    }

    #[test]
    fn fingerprint_separates_instances_and_params() {
        let p = params(&[("limit", "20")]);
        let a = fingerprint("timeline", "GET", "/t", &p, None, "mastodon.social");
        let b = fingerprint("timeline", "GET", "/t", &p, None, "fosstodon.org");
        assert_ne!(a, b);

        let c = fingerprint("timeline", "GET", "/t", &params(&[("limit", "40")]), None, "mastodon.social");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn local_tier_roundtrip_and_invalidation() {
        let cache = CacheService::in_process(CacheConfig::default());
        let key = fingerprint("timeline", "GET", "/t", &[], None, "m.s");

        assert!(cache.get(&key).await.is_none());
        cache.put(&key, ContentClass::Timeline, response()).await;
        assert_eq!(cache.get(&key).await, Some(response()));

        cache.invalidate(&key).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn alias_invalidation_spares_other_scopes() {
        let cache = CacheService::in_process(CacheConfig::default());
        let alice = UserAlias::from_raw("alice");
        let bob = UserAlias::from_raw("bob");

        let alice_key = fingerprint("timeline", "GET", "/t", &[], Some(&alice), "m.s");
        let bob_key = fingerprint("timeline", "GET", "/t", &[], Some(&bob), "m.s");
        let public_key = fingerprint("timeline", "GET", "/t", &[], None, "m.s");

        cache.put(&alice_key, ContentClass::Timeline, response()).await;
        cache.put(&bob_key, ContentClass::Timeline, response()).await;
        cache.put(&public_key, ContentClass::Timeline, response()).await;

        cache.invalidate_alias(&alice).await;

        assert!(cache.get(&alice_key).await.is_none());
        assert!(cache.get(&bob_key).await.is_some());
        assert!(cache.get(&public_key).await.is_some());
    }

    #[tokio::test]
    async fn eviction_keeps_the_map_bounded() {
        let config = CacheConfig {
            local_capacity: 10,
            ..CacheConfig::default()
        };
        let cache = CacheService::in_process(config);
        for i in 0..50 {
            let key = format!("corgi:cache:public:{i}");
            cache.put(&key, ContentClass::Default, response()).await;
        }
        assert!(cache.inner.local.len() <= 11);
    }
}
