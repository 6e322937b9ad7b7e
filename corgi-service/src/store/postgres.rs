//! PostgreSQL store for production deployments

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError, StoreErrorKind, StoreOperation};
use crate::identity::UserAlias;
use crate::models::{
    DiscoveryMeta, DiscoverySource, EngagementCounts, Interaction, InteractionAction,
    MediaDescriptor, NewInteraction, Post, PostKey, RankingRecord, ReasonCategory, TokenMapping,
};

use super::{in_clause_chunks, Store, StoreResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS posts (
    instance            TEXT NOT NULL,
    post_id             TEXT NOT NULL,
    author              TEXT NOT NULL,
    content             TEXT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    language            TEXT,
    language_confidence DOUBLE PRECISION,
    tags                TEXT NOT NULL DEFAULT '[]',
    favourites          BIGINT NOT NULL DEFAULT 0,
    reblogs             BIGINT NOT NULL DEFAULT 0,
    replies             BIGINT NOT NULL DEFAULT 0,
    media               TEXT NOT NULL DEFAULT '[]',
    discovery_source    TEXT NOT NULL,
    discovered_at       TIMESTAMPTZ NOT NULL,
    discovery_reason    TEXT NOT NULL,
    PRIMARY KEY (instance, post_id)
);
CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at);
CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author);

CREATE TABLE IF NOT EXISTS interactions (
    id         BIGSERIAL PRIMARY KEY,
    alias      TEXT NOT NULL,
    instance   TEXT NOT NULL,
    post_id    TEXT NOT NULL,
    action     TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    context    TEXT
);
CREATE INDEX IF NOT EXISTS idx_interactions_alias ON interactions(alias, created_at);
CREATE INDEX IF NOT EXISTS idx_interactions_post ON interactions(instance, post_id);

CREATE TABLE IF NOT EXISTS rankings (
    alias           TEXT NOT NULL,
    instance        TEXT NOT NULL,
    post_id         TEXT NOT NULL,
    score           DOUBLE PRECISION NOT NULL,
    reason_category TEXT NOT NULL,
    reason_detail   TEXT,
    generated_at    TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (alias, instance, post_id)
);

CREATE TABLE IF NOT EXISTS token_mappings (
    token      TEXT PRIMARY KEY,
    alias      TEXT NOT NULL,
    instance   TEXT NOT NULL,
    expires_at TIMESTAMPTZ,
    scopes     TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS crawl_watermarks (
    instance TEXT NOT NULL,
    source   TEXT NOT NULL,
    last_id  TEXT NOT NULL,
    PRIMARY KEY (instance, source)
);
";

/// PostgreSQL-backed [`Store`]
pub struct PostgresStore {
    pool: PgPool,
    in_clause_limit: usize,
}

impl PostgresStore {
    /// Create the connection pool with retry and bootstrap the schema
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            StoreError::new(
                StoreOperation::Connect,
                StoreErrorKind::ConnectionFailed,
                "postgres backend requires store.url",
            )
        })?;

        let pool = Self::create_pool_with_retries(config, url).await?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| map_err(StoreOperation::Schema, e))?;
        }

        tracing::info!(
            max = config.max_connections,
            min = config.min_connections,
            "Postgres store ready"
        );

        Ok(Self {
            pool,
            in_clause_limit: config.in_clause_limit,
        })
    }

    async fn create_pool_with_retries(config: &StoreConfig, url: &str) -> Result<PgPool> {
        let mut attempt = 0;
        let base_delay = Duration::from_secs(config.retry_delay_secs);

        loop {
            let result = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
                .connect(url)
                .await;

            match result {
                Ok(pool) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Postgres connection established after {} attempt(s)",
                            attempt + 1
                        );
                    }
                    return Ok(pool);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        tracing::error!(
                            "Failed to connect to Postgres after {} attempts: {}",
                            config.max_retries + 1,
                            e
                        );
                        return Err(StoreError::connection_failed(e.to_string()).into());
                    }

                    let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                    tracing::warn!(
                        "Postgres connection attempt {} failed: {}. Retrying in {:?}...",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn map_err(operation: StoreOperation, e: sqlx::Error) -> StoreError {
    let kind = match &e {
        sqlx::Error::RowNotFound => StoreErrorKind::NotFound,
        sqlx::Error::PoolTimedOut => StoreErrorKind::PoolExhausted,
        sqlx::Error::Io(_) => StoreErrorKind::ConnectionFailed,
        sqlx::Error::Database(db) => match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation
            | sqlx::error::ErrorKind::ForeignKeyViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::CheckViolation => StoreErrorKind::ConstraintViolation,
            _ => {
                // 55P03 lock_not_available, 40001 serialization_failure
                match db.code().as_deref() {
                    Some("55P03") | Some("40001") | Some("40P01") => StoreErrorKind::Busy,
                    _ => StoreErrorKind::QueryFailed,
                }
            }
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreErrorKind::TypeConversion
        }
        _ => StoreErrorKind::QueryFailed,
    };
    StoreError::new(operation, kind, e.to_string())
}

fn json_from_db<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| {
        StoreError::new(
            StoreOperation::Query,
            StoreErrorKind::TypeConversion,
            format!("bad {what} json: {e}"),
        )
    })
}

const POST_COLUMNS: &str = "instance, post_id, author, content, created_at, language, \
     language_confidence, tags, favourites, reblogs, replies, media, \
     discovery_source, discovered_at, discovery_reason";

fn row_to_post(row: &sqlx::postgres::PgRow) -> StoreResult<Post> {
    let get_err = |e: sqlx::Error| map_err(StoreOperation::Query, e);

    let discovery_source: String = row.try_get("discovery_source").map_err(get_err)?;
    let source = match discovery_source.as_str() {
        "timeline" => DiscoverySource::Timeline,
        "hashtag" => DiscoverySource::Hashtag,
        "account" => DiscoverySource::Account,
        other => {
            return Err(StoreError::new(
                StoreOperation::Query,
                StoreErrorKind::TypeConversion,
                format!("unknown discovery source {other:?}"),
            ))
        }
    };

    let tags: String = row.try_get("tags").map_err(get_err)?;
    let media: String = row.try_get("media").map_err(get_err)?;
    let favourites: i64 = row.try_get("favourites").map_err(get_err)?;
    let reblogs: i64 = row.try_get("reblogs").map_err(get_err)?;
    let replies: i64 = row.try_get("replies").map_err(get_err)?;

    Ok(Post {
        key: PostKey::new(
            row.try_get::<String, _>("instance").map_err(get_err)?,
            row.try_get::<String, _>("post_id").map_err(get_err)?,
        ),
        author: row.try_get("author").map_err(get_err)?,
        content: row.try_get("content").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        language: row.try_get("language").map_err(get_err)?,
        language_confidence: row.try_get("language_confidence").map_err(get_err)?,
        tags: json_from_db(&tags, "tags")?,
        engagement: EngagementCounts {
            favourites: favourites.max(0) as u64,
            reblogs: reblogs.max(0) as u64,
            replies: replies.max(0) as u64,
        },
        media: json_from_db::<Vec<MediaDescriptor>>(&media, "media")?,
        discovery: DiscoveryMeta {
            source,
            discovered_at: row.try_get("discovered_at").map_err(get_err)?,
            reason: row.try_get("discovery_reason").map_err(get_err)?,
        },
    })
}

fn row_to_interaction(row: &sqlx::postgres::PgRow) -> StoreResult<Interaction> {
    let get_err = |e: sqlx::Error| map_err(StoreOperation::Query, e);

    let action: String = row.try_get("action").map_err(get_err)?;
    let action = InteractionAction::parse(&action).ok_or_else(|| {
        StoreError::new(
            StoreOperation::Query,
            StoreErrorKind::TypeConversion,
            format!("unknown action {action:?}"),
        )
    })?;

    let context: Option<String> = row.try_get("context").map_err(get_err)?;

    Ok(Interaction {
        id: row.try_get("id").map_err(get_err)?,
        alias: UserAlias::from_raw(row.try_get::<String, _>("alias").map_err(get_err)?),
        post_key: PostKey::new(
            row.try_get::<String, _>("instance").map_err(get_err)?,
            row.try_get::<String, _>("post_id").map_err(get_err)?,
        ),
        action,
        created_at: row.try_get("created_at").map_err(get_err)?,
        context: match context {
            Some(raw) => Some(json_from_db(&raw, "context")?),
            None => None,
        },
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| map_err(StoreOperation::Query, e))
    }

    async fn upsert_post(&self, post: &Post) -> StoreResult<()> {
        let tags = serde_json::to_string(&post.tags).unwrap_or_else(|_| "[]".to_string());
        let media = serde_json::to_string(&post.media).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            "INSERT INTO posts (instance, post_id, author, content, created_at, language, \
             language_confidence, tags, favourites, reblogs, replies, media, \
             discovery_source, discovered_at, discovery_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (instance, post_id) DO UPDATE SET \
               author = EXCLUDED.author, \
               content = EXCLUDED.content, \
               created_at = EXCLUDED.created_at, \
               language = COALESCE(EXCLUDED.language, posts.language), \
               language_confidence = COALESCE(EXCLUDED.language_confidence, posts.language_confidence), \
               tags = EXCLUDED.tags, \
               favourites = GREATEST(posts.favourites, EXCLUDED.favourites), \
               reblogs = GREATEST(posts.reblogs, EXCLUDED.reblogs), \
               replies = GREATEST(posts.replies, EXCLUDED.replies), \
               media = EXCLUDED.media",
        )
        .bind(&post.key.instance)
        .bind(&post.key.post_id)
        .bind(&post.author)
        .bind(&post.content)
        .bind(post.created_at)
        .bind(&post.language)
        .bind(post.language_confidence)
        .bind(tags)
        .bind(post.engagement.favourites as i64)
        .bind(post.engagement.reblogs as i64)
        .bind(post.engagement.replies as i64)
        .bind(media)
        .bind(post.discovery.source.to_string())
        .bind(post.discovery.discovered_at)
        .bind(&post.discovery.reason)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| map_err(StoreOperation::Insert, e))
    }

    async fn get_posts(&self, keys: &[PostKey]) -> StoreResult<Vec<Post>> {
        let mut by_instance: std::collections::HashMap<&str, Vec<String>> =
            std::collections::HashMap::new();
        for key in keys {
            by_instance
                .entry(key.instance.as_str())
                .or_default()
                .push(key.post_id.clone());
        }

        let mut posts = Vec::with_capacity(keys.len());
        for (instance, ids) in by_instance {
            for chunk in in_clause_chunks(&ids, self.in_clause_limit) {
                let sql = format!(
                    "SELECT {POST_COLUMNS} FROM posts WHERE instance = $1 AND post_id = ANY($2)"
                );
                let rows = sqlx::query(&sql)
                    .bind(instance)
                    .bind(chunk)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| map_err(StoreOperation::Query, e))?;
                for row in &rows {
                    posts.push(row_to_post(row)?);
                }
            }
        }
        Ok(posts)
    }

    async fn recent_posts(&self, since: DateTime<Utc>, cap: usize) -> StoreResult<Vec<Post>> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE created_at > $1 \
             ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(cap as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;
        rows.iter().map(row_to_post).collect()
    }

    async fn posts_by_authors(
        &self,
        authors: &[String],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<Post>> {
        let mut posts = Vec::new();
        for chunk in in_clause_chunks(authors, self.in_clause_limit) {
            let sql = format!(
                "SELECT {POST_COLUMNS} FROM posts \
                 WHERE author = ANY($1) AND created_at > $2 \
                 ORDER BY created_at DESC LIMIT $3"
            );
            let rows = sqlx::query(&sql)
                .bind(chunk)
                .bind(since)
                .bind(cap as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_err(StoreOperation::Query, e))?;
            for row in &rows {
                posts.push(row_to_post(row)?);
            }
        }
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        posts.truncate(cap);
        Ok(posts)
    }

    async fn delete_posts_by_authors(&self, authors: &[String]) -> StoreResult<u64> {
        let mut removed = 0;
        for chunk in in_clause_chunks(authors, self.in_clause_limit) {
            let result = sqlx::query("DELETE FROM posts WHERE author = ANY($1)")
                .bind(chunk)
                .execute(&self.pool)
                .await
                .map_err(|e| map_err(StoreOperation::Delete, e))?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    async fn sweep_posts(
        &self,
        cutoff: DateTime<Utc>,
        keep_interacted_since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM posts WHERE created_at < $1 AND NOT EXISTS ( \
               SELECT 1 FROM interactions i \
               WHERE i.instance = posts.instance AND i.post_id = posts.post_id \
                 AND i.created_at > $2)",
        )
        .bind(cutoff)
        .bind(keep_interacted_since)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err(StoreOperation::Delete, e))?;
        Ok(result.rows_affected())
    }

    async fn append_interaction(&self, interaction: &NewInteraction) -> StoreResult<Interaction> {
        let context = interaction
            .context
            .as_ref()
            .map(|c| serde_json::to_string(c).unwrap_or_else(|_| "{}".to_string()));

        // Server-assigned, monotonic per alias; ties advance by a millisecond.
        let row = sqlx::query(
            "INSERT INTO interactions (alias, instance, post_id, action, created_at, context) \
             SELECT $1, $2, $3, $4, \
               GREATEST(now(), COALESCE( \
                 (SELECT MAX(created_at) + interval '1 millisecond' \
                  FROM interactions WHERE alias = $1), \
                 now())), \
               $5 \
             RETURNING id, created_at",
        )
        .bind(interaction.alias.as_str())
        .bind(&interaction.post_key.instance)
        .bind(&interaction.post_key.post_id)
        .bind(interaction.action.as_str())
        .bind(context)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_err(StoreOperation::Insert, e))?;

        let get_err = |e: sqlx::Error| map_err(StoreOperation::Insert, e);
        Ok(Interaction {
            id: row.try_get("id").map_err(get_err)?,
            alias: interaction.alias.clone(),
            post_key: interaction.post_key.clone(),
            action: interaction.action,
            created_at: row.try_get("created_at").map_err(get_err)?,
            context: interaction.context.clone(),
        })
    }

    async fn interactions_for_alias(
        &self,
        alias: &UserAlias,
        cap: usize,
    ) -> StoreResult<Vec<Interaction>> {
        let rows = sqlx::query(
            "SELECT id, alias, instance, post_id, action, created_at, context \
             FROM interactions WHERE alias = $1 \
             ORDER BY created_at ASC, id ASC LIMIT $2",
        )
        .bind(alias.as_str())
        .bind(cap as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err(StoreOperation::Query, e))?;
        rows.iter().map(row_to_interaction).collect()
    }

    async fn interactions_for_alias_post(
        &self,
        alias: &UserAlias,
        key: &PostKey,
    ) -> StoreResult<Vec<Interaction>> {
        let rows = sqlx::query(
            "SELECT id, alias, instance, post_id, action, created_at, context \
             FROM interactions \
             WHERE alias = $1 AND instance = $2 AND post_id = $3 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(alias.as_str())
        .bind(&key.instance)
        .bind(&key.post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err(StoreOperation::Query, e))?;
        rows.iter().map(row_to_interaction).collect()
    }

    async fn aliases_interacting_with_authors(
        &self,
        authors: &[String],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<UserAlias>> {
        let mut aliases = Vec::new();
        for chunk in in_clause_chunks(authors, self.in_clause_limit) {
            let rows = sqlx::query(
                "SELECT DISTINCT i.alias FROM interactions i \
                 JOIN posts p ON p.instance = i.instance AND p.post_id = i.post_id \
                 WHERE p.author = ANY($1) AND i.created_at > $2 LIMIT $3",
            )
            .bind(chunk)
            .bind(since)
            .bind(cap as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;
            for row in &rows {
                let alias: String = row
                    .try_get("alias")
                    .map_err(|e| map_err(StoreOperation::Query, e))?;
                let alias = UserAlias::from_raw(alias);
                if !aliases.contains(&alias) {
                    aliases.push(alias);
                }
            }
        }
        aliases.truncate(cap);
        Ok(aliases)
    }

    async fn posts_engaged_by(
        &self,
        aliases: &[UserAlias],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<PostKey>> {
        let alias_strings: Vec<String> =
            aliases.iter().map(|a| a.as_str().to_string()).collect();

        let mut keys = Vec::new();
        for chunk in in_clause_chunks(&alias_strings, self.in_clause_limit) {
            let rows = sqlx::query(
                "SELECT DISTINCT instance, post_id FROM interactions \
                 WHERE alias = ANY($1) AND created_at > $2 LIMIT $3",
            )
            .bind(chunk)
            .bind(since)
            .bind(cap as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;
            for row in &rows {
                let get_err = |e: sqlx::Error| map_err(StoreOperation::Query, e);
                let key = PostKey::new(
                    row.try_get::<String, _>("instance").map_err(get_err)?,
                    row.try_get::<String, _>("post_id").map_err(get_err)?,
                );
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys.truncate(cap);
        Ok(keys)
    }

    async fn replace_rankings(
        &self,
        alias: &UserAlias,
        records: &[RankingRecord],
    ) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_err(StoreOperation::Transaction, e))?;

        sqlx::query("DELETE FROM rankings WHERE alias = $1")
            .bind(alias.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_err(StoreOperation::Delete, e))?;

        for record in records {
            sqlx::query(
                "INSERT INTO rankings (alias, instance, post_id, score, reason_category, \
                 reason_detail, generated_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(alias.as_str())
            .bind(&record.post_key.instance)
            .bind(&record.post_key.post_id)
            .bind(record.score)
            .bind(record.reason_category.to_string())
            .bind(&record.reason_detail)
            .bind(record.generated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_err(StoreOperation::Insert, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_err(StoreOperation::Transaction, e))
    }

    async fn rankings_for_alias(&self, alias: &UserAlias) -> StoreResult<Vec<RankingRecord>> {
        let rows = sqlx::query(
            "SELECT instance, post_id, score, reason_category, reason_detail, generated_at \
             FROM rankings WHERE alias = $1 ORDER BY score DESC",
        )
        .bind(alias.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err(StoreOperation::Query, e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let get_err = |e: sqlx::Error| map_err(StoreOperation::Query, e);
            let reason_category: String = row.try_get("reason_category").map_err(get_err)?;
            let reason_category = match reason_category.as_str() {
                "author_affinity" => ReasonCategory::AuthorAffinity,
                "engagement" => ReasonCategory::Engagement,
                "recency" => ReasonCategory::Recency,
                "content_affinity" => ReasonCategory::ContentAffinity,
                "trending" => ReasonCategory::Trending,
                "serendipity" => ReasonCategory::Serendipity,
                other => {
                    return Err(StoreError::new(
                        StoreOperation::Query,
                        StoreErrorKind::TypeConversion,
                        format!("unknown reason category {other:?}"),
                    ))
                }
            };
            records.push(RankingRecord {
                alias: alias.clone(),
                post_key: PostKey::new(
                    row.try_get::<String, _>("instance").map_err(get_err)?,
                    row.try_get::<String, _>("post_id").map_err(get_err)?,
                ),
                score: row.try_get("score").map_err(get_err)?,
                reason_category,
                reason_detail: row.try_get("reason_detail").map_err(get_err)?,
                generated_at: row.try_get("generated_at").map_err(get_err)?,
            });
        }
        Ok(records)
    }

    async fn token_mapping(&self, token: &str) -> StoreResult<Option<TokenMapping>> {
        let row = sqlx::query(
            "SELECT token, alias, instance, expires_at, scopes \
             FROM token_mappings WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err(StoreOperation::Query, e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let get_err = |e: sqlx::Error| map_err(StoreOperation::Query, e);
        let scopes: String = row.try_get("scopes").map_err(get_err)?;

        Ok(Some(TokenMapping {
            alias: UserAlias::from_raw(row.try_get::<String, _>("alias").map_err(get_err)?),
            instance: row.try_get("instance").map_err(get_err)?,
            token: row.try_get("token").map_err(get_err)?,
            expires_at: row.try_get("expires_at").map_err(get_err)?,
            scopes: json_from_db(&scopes, "scopes")?,
        }))
    }

    async fn watermark(&self, instance: &str, source: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            "SELECT last_id FROM crawl_watermarks WHERE instance = $1 AND source = $2",
        )
        .bind(instance)
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err(StoreOperation::Query, e))?;

        match row {
            Some(row) => Ok(Some(
                row.try_get("last_id")
                    .map_err(|e| map_err(StoreOperation::Query, e))?,
            )),
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, instance: &str, source: &str, last_id: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO crawl_watermarks (instance, source, last_id) VALUES ($1, $2, $3) \
             ON CONFLICT (instance, source) DO UPDATE SET last_id = EXCLUDED.last_id",
        )
        .bind(instance)
        .bind(source)
        .bind(last_id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| map_err(StoreOperation::Update, e))
    }
}
