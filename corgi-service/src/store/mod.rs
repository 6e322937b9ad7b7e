//! Persistence behind one interface
//!
//! Three adapters implement [`Store`]: a libsql file-backed store for
//! single-node development, a PostgreSQL store for production, and a
//! volatile in-memory store for tests. Schemas map the domain model
//! directly; dialect differences are confined to the adapters. All queries
//! are parameterized; identifier interpolation only ever uses compile-time
//! constants.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{Config, StoreBackendKind};
use crate::error::{Result, StoreError};
use crate::identity::UserAlias;
use crate::models::{Interaction, NewInteraction, Post, PostKey, RankingRecord, TokenMapping};

pub mod embedded;
pub mod memory;
pub mod postgres;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One interface over every persistence backend.
///
/// Operations are bulk-first: lookups take slices and return everything in
/// one round trip (chunked under the configured IN-clause limit inside the
/// adapter). Per-item store calls from the ranking path are a regression.
#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap connectivity probe for readiness checks
    async fn ping(&self) -> StoreResult<()>;

    // ------------------------------------------------------------------
    // Corpus
    // ------------------------------------------------------------------

    /// Insert or refresh a post. The first insert's `discovered_at` is
    /// preserved; engagement counters merge by field-wise maximum. Writes
    /// for one `(instance, post_id)` are serialized by the backend.
    async fn upsert_post(&self, post: &Post) -> StoreResult<()>;

    /// Bulk fetch by key; missing keys are simply absent from the result
    async fn get_posts(&self, keys: &[PostKey]) -> StoreResult<Vec<Post>>;

    /// Posts created after `since`, newest first, capped
    async fn recent_posts(&self, since: DateTime<Utc>, cap: usize) -> StoreResult<Vec<Post>>;

    /// Posts by any of `authors` created after `since`, newest first
    async fn posts_by_authors(
        &self,
        authors: &[String],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<Post>>;

    /// Remove every post by the given authors (opt-out enforcement)
    async fn delete_posts_by_authors(&self, authors: &[String]) -> StoreResult<u64>;

    /// Lifecycle sweep: delete posts created before `cutoff` unless some
    /// interaction after `keep_interacted_since` still references them
    async fn sweep_posts(
        &self,
        cutoff: DateTime<Utc>,
        keep_interacted_since: DateTime<Utc>,
    ) -> StoreResult<u64>;

    // ------------------------------------------------------------------
    // Interactions
    // ------------------------------------------------------------------

    /// Append an interaction. The store assigns the timestamp and keeps it
    /// monotonic per alias; ties are broken by insert order.
    async fn append_interaction(&self, interaction: &NewInteraction) -> StoreResult<Interaction>;

    /// Full history for an alias in `(created_at, id)` order, capped
    async fn interactions_for_alias(
        &self,
        alias: &UserAlias,
        cap: usize,
    ) -> StoreResult<Vec<Interaction>>;

    /// History for one `(alias, post)` pair in `(created_at, id)` order
    async fn interactions_for_alias_post(
        &self,
        alias: &UserAlias,
        key: &PostKey,
    ) -> StoreResult<Vec<Interaction>>;

    /// Aliases that interacted with posts by any of `authors` after `since`
    async fn aliases_interacting_with_authors(
        &self,
        authors: &[String],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<UserAlias>>;

    /// Distinct posts any of `aliases` interacted with after `since`
    async fn posts_engaged_by(
        &self,
        aliases: &[UserAlias],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<PostKey>>;

    // ------------------------------------------------------------------
    // Rankings
    // ------------------------------------------------------------------

    /// Atomically replace the alias's persisted generation
    async fn replace_rankings(
        &self,
        alias: &UserAlias,
        records: &[RankingRecord],
    ) -> StoreResult<()>;

    /// The last persisted generation, highest score first
    async fn rankings_for_alias(&self, alias: &UserAlias) -> StoreResult<Vec<RankingRecord>>;

    // ------------------------------------------------------------------
    // Boundary reads and crawl state
    // ------------------------------------------------------------------

    /// Token-to-alias mapping; writes are owned elsewhere
    async fn token_mapping(&self, token: &str) -> StoreResult<Option<TokenMapping>>;

    /// Cursor below which an instance source has been crawled
    async fn watermark(&self, instance: &str, source: &str) -> StoreResult<Option<String>>;

    /// Advance an instance source's cursor
    async fn set_watermark(&self, instance: &str, source: &str, last_id: &str) -> StoreResult<()>;
}

/// Connect the configured backend
pub async fn connect(config: &Config) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackendKind::Embedded => {
            Arc::new(embedded::EmbeddedStore::connect(&config.store).await?)
        }
        StoreBackendKind::Postgres => {
            Arc::new(postgres::PostgresStore::connect(&config.store).await?)
        }
        StoreBackendKind::Memory => Arc::new(memory::MemoryStore::new()),
    };
    Ok(store)
}

/// Split a slice into chunks no larger than the IN-clause limit.
/// A limit of zero is treated as one.
pub(crate) fn in_clause_chunks<T>(items: &[T], limit: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(limit.max(1))
}
