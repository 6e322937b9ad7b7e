//! Author opt-out cache
//!
//! Opt-out is declared by any configured token (e.g. `#nobots`) appearing in
//! an author's bio or profile fields. Lookups are read-through with a
//! per-author lock; profile fetch failures default-allow under a short TTL
//! so a flaky instance cannot permanently hide an author's opt-out.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::CrawlerConfig;
use crate::proxy::UpstreamClient;

/// TTL for entries written after a failed profile fetch
const FAILURE_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy)]
struct OptOutEntry {
    opted_out: bool,
    expires_at: DateTime<Utc>,
}

/// Read-through cache of author opt-out state
pub struct OptOutCache {
    entries: DashMap<String, OptOutEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    tokens: Vec<String>,
    ttl: Duration,
}

impl OptOutCache {
    /// Build from crawler configuration
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            tokens: config
                .opt_out_tokens
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            ttl: Duration::hours(config.opt_out_ttl_hours.max(1)),
        }
    }

    /// Cached state only; `None` when absent or expired. Never fetches.
    pub fn cached(&self, author: &str) -> Option<bool> {
        let entry = self.entries.get(author)?;
        if entry.expires_at <= Utc::now() {
            return None;
        }
        Some(entry.opted_out)
    }

    /// Cached state with the default-allow rule applied. The ranking and
    /// cold-start paths use this: they must not block on profile fetches.
    pub fn is_opted_out_cached(&self, author: &str) -> bool {
        self.cached(author).unwrap_or(false)
    }

    /// Read-through check: returns the cached state or fetches the author's
    /// profile. Concurrent checks for one author serialize on a per-author
    /// lock so the profile is fetched once.
    pub async fn check(&self, author: &str, client: &UpstreamClient) -> bool {
        if let Some(opted_out) = self.cached(author) {
            return opted_out;
        }

        let lock = self
            .locks
            .entry(author.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another holder may have filled the entry while we waited.
        if let Some(opted_out) = self.cached(author) {
            return opted_out;
        }

        let (opted_out, ttl) = match self.fetch_profile(author, client).await {
            Some(profile) => (self.profile_indicates_opt_out(&profile), self.ttl),
            None => {
                tracing::debug!(author, "profile fetch failed; default-allow with short TTL");
                (false, Duration::minutes(FAILURE_TTL_MINUTES))
            }
        };

        self.entries.insert(
            author.to_string(),
            OptOutEntry {
                opted_out,
                expires_at: Utc::now() + ttl,
            },
        );
        opted_out
    }

    /// Record an observation directly (used when a crawled page already
    /// carries the author's account object)
    pub fn observe_account(&self, author: &str, account: &Value) {
        let opted_out = self.profile_indicates_opt_out(account);
        self.entries.insert(
            author.to_string(),
            OptOutEntry {
                opted_out,
                expires_at: Utc::now() + self.ttl,
            },
        );
    }

    /// Authors currently known to be opted out
    pub fn opted_out_authors(&self) -> Vec<String> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| e.opted_out && e.expires_at > now)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drop expired entries and their locks
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.entries.retain(|_, e| e.expires_at > now);
        self.locks
            .retain(|author, _| self.entries.contains_key(author));
    }

    async fn fetch_profile(&self, author: &str, client: &UpstreamClient) -> Option<Value> {
        let (username, instance) = author.split_once('@')?;
        let path = format!("/api/v1/accounts/lookup?acct={username}");
        let response = client.get_json(instance, &path, None).await.ok()?;
        if response.status != 200 {
            return None;
        }
        response.json().ok()
    }

    fn profile_indicates_opt_out(&self, account: &Value) -> bool {
        let mut haystack = String::new();
        if let Some(note) = account.get("note").and_then(Value::as_str) {
            haystack.push_str(note);
            haystack.push(' ');
        }
        if let Some(fields) = account.get("fields").and_then(Value::as_array) {
            for field in fields {
                for key in ["name", "value"] {
                    if let Some(text) = field.get(key).and_then(Value::as_str) {
                        haystack.push_str(text);
                        haystack.push(' ');
                    }
                }
            }
        }
        let haystack = haystack.to_ascii_lowercase();
        self.tokens.iter().any(|token| haystack.contains(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> OptOutCache {
        OptOutCache::new(&CrawlerConfig::default())
    }

    #[test]
    fn default_allow_when_unknown() {
        let cache = cache();
        assert_eq!(cache.cached("ada@m.s"), None);
        assert!(!cache.is_opted_out_cached("ada@m.s"));
    }

    #[test]
    fn detects_tokens_in_bio_and_fields() {
        let cache = cache();

        cache.observe_account("a@m.s", &json!({"note": "I am a human. #NoBots please"}));
        assert_eq!(cache.cached("a@m.s"), Some(true));

        cache.observe_account(
            "b@m.s",
            &json!({"note": "hi", "fields": [{"name": "bots", "value": "#noindex"}]}),
        );
        assert_eq!(cache.cached("b@m.s"), Some(true));

        cache.observe_account("c@m.s", &json!({"note": "just a regular bio"}));
        assert_eq!(cache.cached("c@m.s"), Some(false));
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let cache = cache();
        cache.entries.insert(
            "stale@m.s".to_string(),
            OptOutEntry {
                opted_out: true,
                expires_at: Utc::now() - Duration::hours(1),
            },
        );
        cache.observe_account("fresh@m.s", &json!({"note": "#nobots"}));

        assert_eq!(cache.cached("stale@m.s"), None);
        cache.sweep_expired();
        assert!(!cache.entries.contains_key("stale@m.s"));
        assert!(cache.entries.contains_key("fresh@m.s"));
    }

    #[test]
    fn opted_out_authors_lists_only_live_optouts() {
        let cache = cache();
        cache.observe_account("out@m.s", &json!({"note": "#nobots"}));
        cache.observe_account("in@m.s", &json!({"note": "hello"}));
        let authors = cache.opted_out_authors();
        assert_eq!(authors, vec!["out@m.s".to_string()]);
    }
}
