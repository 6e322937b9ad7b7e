//! Volatile in-memory store
//!
//! Backs tests and local experiments. Same contract as the durable
//! adapters, including monotonic per-alias interaction timestamps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::identity::UserAlias;
use crate::models::{Interaction, NewInteraction, Post, PostKey, RankingRecord, TokenMapping};

use super::{Store, StoreResult};

#[derive(Default)]
struct Inner {
    posts: HashMap<PostKey, Post>,
    interactions: Vec<Interaction>,
    next_interaction_id: i64,
    last_timestamp: HashMap<UserAlias, DateTime<Utc>>,
    rankings: HashMap<UserAlias, Vec<RankingRecord>>,
    tokens: HashMap<String, TokenMapping>,
    watermarks: HashMap<(String, String), String>,
}

/// In-memory [`Store`] implementation
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a post directly, bypassing the crawler
    pub fn seed_post(&self, post: Post) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.posts.insert(post.key.clone(), post);
    }

    /// Seed a token mapping, standing in for the identity component
    pub fn seed_token(&self, mapping: TokenMapping) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.tokens.insert(mapping.token.clone(), mapping);
    }

    /// Number of posts currently held
    pub fn post_count(&self) -> usize {
        self.inner.lock().expect("memory store poisoned").posts.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn upsert_post(&self, post: &Post) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        match inner.posts.get_mut(&post.key) {
            Some(existing) => {
                let discovery = existing.discovery.clone();
                let engagement = existing.engagement.merge_max(&post.engagement);
                *existing = post.clone();
                existing.discovery.discovered_at = discovery.discovered_at;
                existing.engagement = engagement;
            }
            None => {
                inner.posts.insert(post.key.clone(), post.clone());
            }
        }
        Ok(())
    }

    async fn get_posts(&self, keys: &[PostKey]) -> StoreResult<Vec<Post>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(keys.iter().filter_map(|k| inner.posts.get(k).cloned()).collect())
    }

    async fn recent_posts(&self, since: DateTime<Utc>, cap: usize) -> StoreResult<Vec<Post>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut posts: Vec<Post> = inner
            .posts
            .values()
            .filter(|p| p.created_at > since)
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        posts.truncate(cap);
        Ok(posts)
    }

    async fn posts_by_authors(
        &self,
        authors: &[String],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<Post>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut posts: Vec<Post> = inner
            .posts
            .values()
            .filter(|p| p.created_at > since && authors.contains(&p.author))
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        posts.truncate(cap);
        Ok(posts)
    }

    async fn delete_posts_by_authors(&self, authors: &[String]) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let before = inner.posts.len();
        inner.posts.retain(|_, p| !authors.contains(&p.author));
        Ok((before - inner.posts.len()) as u64)
    }

    async fn sweep_posts(
        &self,
        cutoff: DateTime<Utc>,
        keep_interacted_since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let keep: std::collections::HashSet<PostKey> = inner
            .interactions
            .iter()
            .filter(|i| i.created_at > keep_interacted_since)
            .map(|i| i.post_key.clone())
            .collect();
        let before = inner.posts.len();
        inner
            .posts
            .retain(|key, p| p.created_at >= cutoff || keep.contains(key));
        Ok((before - inner.posts.len()) as u64)
    }

    async fn append_interaction(&self, interaction: &NewInteraction) -> StoreResult<Interaction> {
        let mut inner = self.inner.lock().expect("memory store poisoned");

        // Server-assigned timestamps are monotonic per alias; ties with the
        // wall clock advance by a millisecond.
        let now = Utc::now();
        let assigned = match inner.last_timestamp.get(&interaction.alias) {
            Some(last) if *last >= now => *last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        inner
            .last_timestamp
            .insert(interaction.alias.clone(), assigned);

        inner.next_interaction_id += 1;
        let record = Interaction {
            id: inner.next_interaction_id,
            alias: interaction.alias.clone(),
            post_key: interaction.post_key.clone(),
            action: interaction.action,
            created_at: assigned,
            context: interaction.context.clone(),
        };
        inner.interactions.push(record.clone());
        Ok(record)
    }

    async fn interactions_for_alias(
        &self,
        alias: &UserAlias,
        cap: usize,
    ) -> StoreResult<Vec<Interaction>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut records: Vec<Interaction> = inner
            .interactions
            .iter()
            .filter(|i| &i.alias == alias)
            .cloned()
            .collect();
        records.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        records.truncate(cap);
        Ok(records)
    }

    async fn interactions_for_alias_post(
        &self,
        alias: &UserAlias,
        key: &PostKey,
    ) -> StoreResult<Vec<Interaction>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut records: Vec<Interaction> = inner
            .interactions
            .iter()
            .filter(|i| &i.alias == alias && &i.post_key == key)
            .cloned()
            .collect();
        records.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(records)
    }

    async fn aliases_interacting_with_authors(
        &self,
        authors: &[String],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<UserAlias>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut seen = Vec::new();
        for record in &inner.interactions {
            if record.created_at <= since {
                continue;
            }
            let Some(post) = inner.posts.get(&record.post_key) else {
                continue;
            };
            if authors.contains(&post.author) && !seen.contains(&record.alias) {
                seen.push(record.alias.clone());
                if seen.len() >= cap {
                    break;
                }
            }
        }
        Ok(seen)
    }

    async fn posts_engaged_by(
        &self,
        aliases: &[UserAlias],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<PostKey>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut keys = Vec::new();
        for record in &inner.interactions {
            if record.created_at > since
                && aliases.contains(&record.alias)
                && !keys.contains(&record.post_key)
            {
                keys.push(record.post_key.clone());
                if keys.len() >= cap {
                    break;
                }
            }
        }
        Ok(keys)
    }

    async fn replace_rankings(
        &self,
        alias: &UserAlias,
        records: &[RankingRecord],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let mut sorted = records.to_vec();
        sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        inner.rankings.insert(alias.clone(), sorted);
        Ok(())
    }

    async fn rankings_for_alias(&self, alias: &UserAlias) -> StoreResult<Vec<RankingRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.rankings.get(alias).cloned().unwrap_or_default())
    }

    async fn token_mapping(&self, token: &str) -> StoreResult<Option<TokenMapping>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.tokens.get(token).cloned())
    }

    async fn watermark(&self, instance: &str, source: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .watermarks
            .get(&(instance.to_string(), source.to_string()))
            .cloned())
    }

    async fn set_watermark(&self, instance: &str, source: &str, last_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.watermarks.insert(
            (instance.to_string(), source.to_string()),
            last_id.to_string(),
        );
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiscoveryMeta, DiscoverySource, EngagementCounts, InteractionAction};

    fn post(id: &str, created_at: DateTime<Utc>) -> Post {
        Post {
            key: PostKey::new("mastodon.social", id),
            author: "ada@mastodon.social".to_string(),
            content: "<p>hello</p>".to_string(),
            created_at,
            language: Some("en".to_string()),
            language_confidence: Some(0.9),
            tags: vec!["rust".to_string()],
            engagement: EngagementCounts { favourites: 1, reblogs: 0, replies: 0 },
            media: vec![],
            discovery: DiscoveryMeta {
                source: DiscoverySource::Timeline,
                discovered_at: created_at,
                reason: "public".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn upsert_preserves_discovered_at_and_merges_counters() {
        let store = MemoryStore::new();
        let first_seen = Utc::now() - chrono::Duration::hours(5);
        let mut p = post("1", Utc::now());
        p.discovery.discovered_at = first_seen;
        store.upsert_post(&p).await.unwrap();

        let mut refreshed = p.clone();
        refreshed.discovery.discovered_at = Utc::now();
        refreshed.engagement = EngagementCounts { favourites: 9, reblogs: 2, replies: 0 };
        store.upsert_post(&refreshed).await.unwrap();

        let got = store.get_posts(&[p.key.clone()]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].discovery.discovered_at, first_seen);
        assert_eq!(got[0].engagement.favourites, 9);
    }

    #[tokio::test]
    async fn interaction_timestamps_are_monotonic_per_alias() {
        let store = MemoryStore::new();
        let alias = UserAlias::from_raw("a");
        let mut previous: Option<(DateTime<Utc>, i64)> = None;
        for _ in 0..5 {
            let record = store
                .append_interaction(&NewInteraction {
                    alias: alias.clone(),
                    post_key: PostKey::new("mastodon.social", "1"),
                    action: InteractionAction::View,
                    context: None,
                })
                .await
                .unwrap();
            if let Some((ts, id)) = previous {
                assert!((record.created_at, record.id) > (ts, id));
            }
            previous = Some((record.created_at, record.id));
        }
    }

    #[tokio::test]
    async fn sweep_keeps_engagement_relevant_posts() {
        let store = MemoryStore::new();
        let old = Utc::now() - chrono::Duration::days(30);
        store.seed_post(post("old-kept", old));
        store.seed_post(post("old-dropped", old));
        store.seed_post(post("fresh", Utc::now()));

        store
            .append_interaction(&NewInteraction {
                alias: UserAlias::from_raw("a"),
                post_key: PostKey::new("mastodon.social", "old-kept"),
                action: InteractionAction::Favorite,
                context: None,
            })
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(14);
        let removed = store.sweep_posts(cutoff, cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.post_count(), 2);
    }
}
