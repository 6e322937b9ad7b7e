//! libsql file-backed store for single-node development

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params_from_iter;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

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
    created_at          TEXT NOT NULL,
    language            TEXT,
    language_confidence REAL,
    tags                TEXT NOT NULL DEFAULT '[]',
    favourites          INTEGER NOT NULL DEFAULT 0,
    reblogs             INTEGER NOT NULL DEFAULT 0,
    replies             INTEGER NOT NULL DEFAULT 0,
    media               TEXT NOT NULL DEFAULT '[]',
    discovery_source    TEXT NOT NULL,
    discovered_at       TEXT NOT NULL,
    discovery_reason    TEXT NOT NULL,
    PRIMARY KEY (instance, post_id)
);
CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at);
CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author);

CREATE TABLE IF NOT EXISTS interactions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    alias      TEXT NOT NULL,
    instance   TEXT NOT NULL,
    post_id    TEXT NOT NULL,
    action     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    context    TEXT
);
CREATE INDEX IF NOT EXISTS idx_interactions_alias ON interactions(alias, created_at);
CREATE INDEX IF NOT EXISTS idx_interactions_post ON interactions(instance, post_id);

CREATE TABLE IF NOT EXISTS rankings (
    alias           TEXT NOT NULL,
    instance        TEXT NOT NULL,
    post_id         TEXT NOT NULL,
    score           REAL NOT NULL,
    reason_category TEXT NOT NULL,
    reason_detail   TEXT,
    generated_at    TEXT NOT NULL,
    PRIMARY KEY (alias, instance, post_id)
);

CREATE TABLE IF NOT EXISTS token_mappings (
    token      TEXT PRIMARY KEY,
    alias      TEXT NOT NULL,
    instance   TEXT NOT NULL,
    expires_at TEXT,
    scopes     TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS crawl_watermarks (
    instance TEXT NOT NULL,
    source   TEXT NOT NULL,
    last_id  TEXT NOT NULL,
    PRIMARY KEY (instance, source)
);
";

/// libsql-backed [`Store`]
pub struct EmbeddedStore {
    conn: libsql::Connection,
    // SQLite allows one writer; serializing here turns SQLITE_BUSY storms
    // into orderly queueing.
    write_lock: Mutex<()>,
    in_clause_limit: usize,
    _db: libsql::Database,
}

impl EmbeddedStore {
    /// Open (or create) the database file with retry and bootstrap the schema
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let db = Self::open_with_retries(config).await?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::connection_failed(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| map_err(StoreOperation::Schema, e))?;

        tracing::info!(path = %config.path.display(), "Embedded store ready");

        Ok(Self {
            conn,
            write_lock: Mutex::new(()),
            in_clause_limit: config.in_clause_limit,
            _db: db,
        })
    }

    async fn open_with_retries(config: &StoreConfig) -> Result<libsql::Database> {
        let mut attempt = 0;
        let base_delay = Duration::from_secs(config.retry_delay_secs);

        loop {
            match libsql::Builder::new_local(&config.path).build().await {
                Ok(db) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Embedded store opened after {} attempt(s)",
                            attempt + 1
                        );
                    }
                    return Ok(db);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        tracing::error!(
                            "Failed to open embedded store after {} attempts: {}",
                            config.max_retries + 1,
                            e
                        );
                        return Err(StoreError::connection_failed(e.to_string()).into());
                    }

                    let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                    tracing::warn!(
                        "Embedded store open attempt {} failed: {}. Retrying in {:?}...",
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

fn map_err(operation: StoreOperation, e: libsql::Error) -> StoreError {
    let message = e.to_string();
    let lowered = message.to_ascii_lowercase();
    let kind = if lowered.contains("busy") || lowered.contains("locked") {
        StoreErrorKind::Busy
    } else if lowered.contains("unique") || lowered.contains("constraint") {
        StoreErrorKind::ConstraintViolation
    } else {
        StoreErrorKind::QueryFailed
    };
    StoreError::new(operation, kind, message)
}

fn ts_to_db(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC rendering keeps lexicographic order chronological.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_db(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            StoreError::new(
                StoreOperation::Query,
                StoreErrorKind::TypeConversion,
                format!("bad timestamp {raw:?}: {e}"),
            )
        })
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

fn row_to_post(row: &libsql::Row) -> StoreResult<Post> {
    let get_err = |e: libsql::Error| map_err(StoreOperation::Query, e);

    let instance: String = row.get(0).map_err(get_err)?;
    let post_id: String = row.get(1).map_err(get_err)?;
    let author: String = row.get(2).map_err(get_err)?;
    let content: String = row.get(3).map_err(get_err)?;
    let created_at: String = row.get(4).map_err(get_err)?;
    let language: Option<String> = row.get(5).map_err(get_err)?;
    let language_confidence: Option<f64> = row.get(6).map_err(get_err)?;
    let tags: String = row.get(7).map_err(get_err)?;
    let favourites: i64 = row.get(8).map_err(get_err)?;
    let reblogs: i64 = row.get(9).map_err(get_err)?;
    let replies: i64 = row.get(10).map_err(get_err)?;
    let media: String = row.get(11).map_err(get_err)?;
    let discovery_source: String = row.get(12).map_err(get_err)?;
    let discovered_at: String = row.get(13).map_err(get_err)?;
    let discovery_reason: String = row.get(14).map_err(get_err)?;

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

    Ok(Post {
        key: PostKey::new(instance, post_id),
        author,
        content,
        created_at: ts_from_db(&created_at)?,
        language,
        language_confidence,
        tags: json_from_db(&tags, "tags")?,
        engagement: EngagementCounts {
            favourites: favourites.max(0) as u64,
            reblogs: reblogs.max(0) as u64,
            replies: replies.max(0) as u64,
        },
        media: json_from_db::<Vec<MediaDescriptor>>(&media, "media")?,
        discovery: DiscoveryMeta {
            source,
            discovered_at: ts_from_db(&discovered_at)?,
            reason: discovery_reason,
        },
    })
}

fn row_to_interaction(row: &libsql::Row) -> StoreResult<Interaction> {
    let get_err = |e: libsql::Error| map_err(StoreOperation::Query, e);

    let id: i64 = row.get(0).map_err(get_err)?;
    let alias: String = row.get(1).map_err(get_err)?;
    let instance: String = row.get(2).map_err(get_err)?;
    let post_id: String = row.get(3).map_err(get_err)?;
    let action: String = row.get(4).map_err(get_err)?;
    let created_at: String = row.get(5).map_err(get_err)?;
    let context: Option<String> = row.get(6).map_err(get_err)?;

    let action = InteractionAction::parse(&action).ok_or_else(|| {
        StoreError::new(
            StoreOperation::Query,
            StoreErrorKind::TypeConversion,
            format!("unknown action {action:?}"),
        )
    })?;

    Ok(Interaction {
        id,
        alias: UserAlias::from_raw(alias),
        post_key: PostKey::new(instance, post_id),
        action,
        created_at: ts_from_db(&created_at)?,
        context: match context {
            Some(raw) => Some(json_from_db(&raw, "context")?),
            None => None,
        },
    })
}

fn row_to_ranking(row: &libsql::Row, alias: &UserAlias) -> StoreResult<RankingRecord> {
    let get_err = |e: libsql::Error| map_err(StoreOperation::Query, e);

    let instance: String = row.get(0).map_err(get_err)?;
    let post_id: String = row.get(1).map_err(get_err)?;
    let score: f64 = row.get(2).map_err(get_err)?;
    let reason_category: String = row.get(3).map_err(get_err)?;
    let reason_detail: Option<String> = row.get(4).map_err(get_err)?;
    let generated_at: String = row.get(5).map_err(get_err)?;

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

    Ok(RankingRecord {
        alias: alias.clone(),
        post_key: PostKey::new(instance, post_id),
        score,
        reason_category,
        reason_detail,
        generated_at: ts_from_db(&generated_at)?,
    })
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}

#[async_trait]
impl Store for EmbeddedStore {
    async fn ping(&self) -> StoreResult<()> {
        self.conn
            .query("SELECT 1", ())
            .await
            .map(|_| ())
            .map_err(|e| map_err(StoreOperation::Query, e))
    }

    async fn upsert_post(&self, post: &Post) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let tags = serde_json::to_string(&post.tags).unwrap_or_else(|_| "[]".to_string());
        let media = serde_json::to_string(&post.media).unwrap_or_else(|_| "[]".to_string());

        self.conn
            .execute(
                "INSERT INTO posts (instance, post_id, author, content, created_at, language, \
                 language_confidence, tags, favourites, reblogs, replies, media, \
                 discovery_source, discovered_at, discovery_reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
                 ON CONFLICT(instance, post_id) DO UPDATE SET \
                   author = excluded.author, \
                   content = excluded.content, \
                   created_at = excluded.created_at, \
                   language = COALESCE(excluded.language, posts.language), \
                   language_confidence = COALESCE(excluded.language_confidence, posts.language_confidence), \
                   tags = excluded.tags, \
                   favourites = MAX(posts.favourites, excluded.favourites), \
                   reblogs = MAX(posts.reblogs, excluded.reblogs), \
                   replies = MAX(posts.replies, excluded.replies), \
                   media = excluded.media",
                libsql::params![
                    post.key.instance.as_str(),
                    post.key.post_id.as_str(),
                    post.author.as_str(),
                    post.content.as_str(),
                    ts_to_db(post.created_at),
                    post.language.clone(),
                    post.language_confidence,
                    tags,
                    post.engagement.favourites as i64,
                    post.engagement.reblogs as i64,
                    post.engagement.replies as i64,
                    media,
                    post.discovery.source.to_string(),
                    ts_to_db(post.discovery.discovered_at),
                    post.discovery.reason.as_str(),
                ],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Insert, e))?;
        Ok(())
    }

    async fn get_posts(&self, keys: &[PostKey]) -> StoreResult<Vec<Post>> {
        let mut by_instance: HashMap<&str, Vec<&str>> = HashMap::new();
        for key in keys {
            by_instance
                .entry(key.instance.as_str())
                .or_default()
                .push(key.post_id.as_str());
        }

        let mut posts = Vec::with_capacity(keys.len());
        for (instance, ids) in by_instance {
            for chunk in in_clause_chunks(&ids, self.in_clause_limit) {
                let sql = format!(
                    "SELECT {POST_COLUMNS} FROM posts WHERE instance = ? AND post_id IN ({})",
                    placeholders(chunk.len())
                );
                let mut params: Vec<libsql::Value> =
                    vec![libsql::Value::Text(instance.to_string())];
                params.extend(chunk.iter().map(|id| libsql::Value::Text(id.to_string())));

                let mut rows = self
                    .conn
                    .query(&sql, params_from_iter(params))
                    .await
                    .map_err(|e| map_err(StoreOperation::Query, e))?;
                while let Some(row) = rows
                    .next()
                    .await
                    .map_err(|e| map_err(StoreOperation::Query, e))?
                {
                    posts.push(row_to_post(&row)?);
                }
            }
        }
        Ok(posts)
    }

    async fn recent_posts(&self, since: DateTime<Utc>, cap: usize) -> StoreResult<Vec<Post>> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE created_at > ?1 \
             ORDER BY created_at DESC LIMIT ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, libsql::params![ts_to_db(since), cap as i64])
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;

        let mut posts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?
        {
            posts.push(row_to_post(&row)?);
        }
        Ok(posts)
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
                 WHERE author IN ({}) AND created_at > ? \
                 ORDER BY created_at DESC LIMIT ?",
                placeholders(chunk.len())
            );
            let mut params: Vec<libsql::Value> = chunk
                .iter()
                .map(|a| libsql::Value::Text(a.clone()))
                .collect();
            params.push(libsql::Value::Text(ts_to_db(since)));
            params.push(libsql::Value::Integer(cap as i64));

            let mut rows = self
                .conn
                .query(&sql, params_from_iter(params))
                .await
                .map_err(|e| map_err(StoreOperation::Query, e))?;
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| map_err(StoreOperation::Query, e))?
            {
                posts.push(row_to_post(&row)?);
            }
        }
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        posts.truncate(cap);
        Ok(posts)
    }

    async fn delete_posts_by_authors(&self, authors: &[String]) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        for chunk in in_clause_chunks(authors, self.in_clause_limit) {
            let sql = format!(
                "DELETE FROM posts WHERE author IN ({})",
                placeholders(chunk.len())
            );
            let params: Vec<libsql::Value> = chunk
                .iter()
                .map(|a| libsql::Value::Text(a.clone()))
                .collect();
            removed += self
                .conn
                .execute(&sql, params_from_iter(params))
                .await
                .map_err(|e| map_err(StoreOperation::Delete, e))?;
        }
        Ok(removed)
    }

    async fn sweep_posts(
        &self,
        cutoff: DateTime<Utc>,
        keep_interacted_since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "DELETE FROM posts WHERE created_at < ?1 AND NOT EXISTS ( \
                   SELECT 1 FROM interactions i \
                   WHERE i.instance = posts.instance AND i.post_id = posts.post_id \
                     AND i.created_at > ?2)",
                libsql::params![ts_to_db(cutoff), ts_to_db(keep_interacted_since)],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Delete, e))
    }

    async fn append_interaction(&self, interaction: &NewInteraction) -> StoreResult<Interaction> {
        let _guard = self.write_lock.lock().await;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| map_err(StoreOperation::Transaction, e))?;

        // Monotonic per alias: never assign at or before the alias's latest
        // stored timestamp.
        let mut rows = tx
            .query(
                "SELECT MAX(created_at) FROM interactions WHERE alias = ?1",
                libsql::params![interaction.alias.as_str()],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;
        let last: Option<String> = match rows
            .next()
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?
        {
            Some(row) => row.get(0).map_err(|e| map_err(StoreOperation::Query, e))?,
            None => None,
        };

        let now = Utc::now();
        let assigned = match last.as_deref().map(ts_from_db).transpose()? {
            Some(last) if last >= now => last + chrono::Duration::milliseconds(1),
            _ => now,
        };

        let context = interaction
            .context
            .as_ref()
            .map(|c| serde_json::to_string(c).unwrap_or_else(|_| "{}".to_string()));

        tx.execute(
            "INSERT INTO interactions (alias, instance, post_id, action, created_at, context) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            libsql::params![
                interaction.alias.as_str(),
                interaction.post_key.instance.as_str(),
                interaction.post_key.post_id.as_str(),
                interaction.action.as_str(),
                ts_to_db(assigned),
                context,
            ],
        )
        .await
        .map_err(|e| map_err(StoreOperation::Insert, e))?;

        let id = tx.last_insert_rowid();

        tx.commit()
            .await
            .map_err(|e| map_err(StoreOperation::Transaction, e))?;

        Ok(Interaction {
            id,
            alias: interaction.alias.clone(),
            post_key: interaction.post_key.clone(),
            action: interaction.action,
            created_at: assigned,
            context: interaction.context.clone(),
        })
    }

    async fn interactions_for_alias(
        &self,
        alias: &UserAlias,
        cap: usize,
    ) -> StoreResult<Vec<Interaction>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, alias, instance, post_id, action, created_at, context \
                 FROM interactions WHERE alias = ?1 \
                 ORDER BY created_at ASC, id ASC LIMIT ?2",
                libsql::params![alias.as_str(), cap as i64],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?
        {
            records.push(row_to_interaction(&row)?);
        }
        Ok(records)
    }

    async fn interactions_for_alias_post(
        &self,
        alias: &UserAlias,
        key: &PostKey,
    ) -> StoreResult<Vec<Interaction>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, alias, instance, post_id, action, created_at, context \
                 FROM interactions \
                 WHERE alias = ?1 AND instance = ?2 AND post_id = ?3 \
                 ORDER BY created_at ASC, id ASC",
                libsql::params![
                    alias.as_str(),
                    key.instance.as_str(),
                    key.post_id.as_str()
                ],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?
        {
            records.push(row_to_interaction(&row)?);
        }
        Ok(records)
    }

    async fn aliases_interacting_with_authors(
        &self,
        authors: &[String],
        since: DateTime<Utc>,
        cap: usize,
    ) -> StoreResult<Vec<UserAlias>> {
        let mut aliases = Vec::new();
        for chunk in in_clause_chunks(authors, self.in_clause_limit) {
            let sql = format!(
                "SELECT DISTINCT i.alias FROM interactions i \
                 JOIN posts p ON p.instance = i.instance AND p.post_id = i.post_id \
                 WHERE p.author IN ({}) AND i.created_at > ? LIMIT ?",
                placeholders(chunk.len())
            );
            let mut params: Vec<libsql::Value> = chunk
                .iter()
                .map(|a| libsql::Value::Text(a.clone()))
                .collect();
            params.push(libsql::Value::Text(ts_to_db(since)));
            params.push(libsql::Value::Integer(cap as i64));

            let mut rows = self
                .conn
                .query(&sql, params_from_iter(params))
                .await
                .map_err(|e| map_err(StoreOperation::Query, e))?;
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| map_err(StoreOperation::Query, e))?
            {
                let alias: String = row.get(0).map_err(|e| map_err(StoreOperation::Query, e))?;
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
            let sql = format!(
                "SELECT DISTINCT instance, post_id FROM interactions \
                 WHERE alias IN ({}) AND created_at > ? LIMIT ?",
                placeholders(chunk.len())
            );
            let mut params: Vec<libsql::Value> = chunk
                .iter()
                .map(|a| libsql::Value::Text(a.clone()))
                .collect();
            params.push(libsql::Value::Text(ts_to_db(since)));
            params.push(libsql::Value::Integer(cap as i64));

            let mut rows = self
                .conn
                .query(&sql, params_from_iter(params))
                .await
                .map_err(|e| map_err(StoreOperation::Query, e))?;
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| map_err(StoreOperation::Query, e))?
            {
                let instance: String =
                    row.get(0).map_err(|e| map_err(StoreOperation::Query, e))?;
                let post_id: String =
                    row.get(1).map_err(|e| map_err(StoreOperation::Query, e))?;
                let key = PostKey::new(instance, post_id);
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
        let _guard = self.write_lock.lock().await;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| map_err(StoreOperation::Transaction, e))?;

        tx.execute(
            "DELETE FROM rankings WHERE alias = ?1",
            libsql::params![alias.as_str()],
        )
        .await
        .map_err(|e| map_err(StoreOperation::Delete, e))?;

        for record in records {
            tx.execute(
                "INSERT INTO rankings (alias, instance, post_id, score, reason_category, \
                 reason_detail, generated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                libsql::params![
                    alias.as_str(),
                    record.post_key.instance.as_str(),
                    record.post_key.post_id.as_str(),
                    record.score,
                    record.reason_category.to_string(),
                    record.reason_detail.clone(),
                    ts_to_db(record.generated_at),
                ],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Insert, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_err(StoreOperation::Transaction, e))
    }

    async fn rankings_for_alias(&self, alias: &UserAlias) -> StoreResult<Vec<RankingRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT instance, post_id, score, reason_category, reason_detail, generated_at \
                 FROM rankings WHERE alias = ?1 ORDER BY score DESC",
                libsql::params![alias.as_str()],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?
        {
            records.push(row_to_ranking(&row, alias)?);
        }
        Ok(records)
    }

    async fn token_mapping(&self, token: &str) -> StoreResult<Option<TokenMapping>> {
        let mut rows = self
            .conn
            .query(
                "SELECT token, alias, instance, expires_at, scopes \
                 FROM token_mappings WHERE token = ?1",
                libsql::params![token],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?
        else {
            return Ok(None);
        };

        let get_err = |e: libsql::Error| map_err(StoreOperation::Query, e);
        let token: String = row.get(0).map_err(get_err)?;
        let alias: String = row.get(1).map_err(get_err)?;
        let instance: String = row.get(2).map_err(get_err)?;
        let expires_at: Option<String> = row.get(3).map_err(get_err)?;
        let scopes: String = row.get(4).map_err(get_err)?;

        Ok(Some(TokenMapping {
            alias: UserAlias::from_raw(alias),
            instance,
            token,
            expires_at: expires_at.as_deref().map(ts_from_db).transpose()?,
            scopes: json_from_db(&scopes, "scopes")?,
        }))
    }

    async fn watermark(&self, instance: &str, source: &str) -> StoreResult<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_id FROM crawl_watermarks WHERE instance = ?1 AND source = ?2",
                libsql::params![instance, source],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?;

        match rows
            .next()
            .await
            .map_err(|e| map_err(StoreOperation::Query, e))?
        {
            Some(row) => {
                let id: String = row.get(0).map_err(|e| map_err(StoreOperation::Query, e))?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, instance: &str, source: &str, last_id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO crawl_watermarks (instance, source, last_id) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(instance, source) DO UPDATE SET last_id = excluded.last_id",
                libsql::params![instance, source, last_id],
            )
            .await
            .map_err(|e| map_err(StoreOperation::Update, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscoverySource;

    async fn temp_store() -> (EmbeddedStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().join("test.db"),
            ..StoreConfig::default()
        };
        let store = EmbeddedStore::connect(&config).await.unwrap();
        (store, dir)
    }

    fn post(id: &str) -> Post {
        Post {
            key: PostKey::new("mastodon.social", id),
            author: "ada@mastodon.social".to_string(),
            content: "<p>hi</p>".to_string(),
            created_at: Utc::now(),
            language: Some("en".to_string()),
            language_confidence: Some(0.8),
            tags: vec!["rust".to_string()],
            engagement: EngagementCounts { favourites: 3, reblogs: 1, replies: 0 },
            media: vec![],
            discovery: DiscoveryMeta {
                source: DiscoverySource::Timeline,
                discovered_at: Utc::now(),
                reason: "public".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn roundtrips_posts_and_merges_counters() {
        let (store, _dir) = temp_store().await;
        let p = post("1");
        store.upsert_post(&p).await.unwrap();

        let mut refreshed = p.clone();
        refreshed.engagement.favourites = 1; // stale refresh must not regress
        refreshed.engagement.reblogs = 4;
        store.upsert_post(&refreshed).await.unwrap();

        let got = store.get_posts(&[p.key.clone()]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].engagement.favourites, 3);
        assert_eq!(got[0].engagement.reblogs, 4);
        assert_eq!(got[0].tags, vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn interactions_are_ordered_and_monotonic() {
        let (store, _dir) = temp_store().await;
        let alias = UserAlias::from_raw("a");
        for _ in 0..3 {
            store
                .append_interaction(&NewInteraction {
                    alias: alias.clone(),
                    post_key: PostKey::new("mastodon.social", "1"),
                    action: InteractionAction::Favorite,
                    context: None,
                })
                .await
                .unwrap();
        }
        let records = store.interactions_for_alias(&alias, 100).await.unwrap();
        assert_eq!(records.len(), 3);
        for pair in records.windows(2) {
            assert!((pair[0].created_at, pair[0].id) < (pair[1].created_at, pair[1].id));
        }
    }

    #[tokio::test]
    async fn rankings_replace_is_atomic_per_alias() {
        let (store, _dir) = temp_store().await;
        let alias = UserAlias::from_raw("a");
        let generated_at = Utc::now();
        let record = |id: &str, score: f64| RankingRecord {
            alias: alias.clone(),
            post_key: PostKey::new("mastodon.social", id),
            score,
            reason_category: ReasonCategory::Trending,
            reason_detail: None,
            generated_at,
        };

        store
            .replace_rankings(&alias, &[record("1", 0.9), record("2", 0.5)])
            .await
            .unwrap();
        store.replace_rankings(&alias, &[record("3", 0.7)]).await.unwrap();

        let got = store.rankings_for_alias(&alias).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].post_key.post_id, "3");
    }

    #[tokio::test]
    async fn watermarks_roundtrip() {
        let (store, _dir) = temp_store().await;
        assert_eq!(store.watermark("m.s", "timeline").await.unwrap(), None);
        store.set_watermark("m.s", "timeline", "100").await.unwrap();
        store.set_watermark("m.s", "timeline", "200").await.unwrap();
        assert_eq!(
            store.watermark("m.s", "timeline").await.unwrap().as_deref(),
            Some("200")
        );
    }
}
