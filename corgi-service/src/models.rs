//! Domain types: posts, interactions, rankings, and their derived state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::identity::UserAlias;

/// Instance reserved for posts this service synthesizes itself
pub const SYNTHETIC_INSTANCE: &str = "corgi";

// ============================================================================
// Posts
// ============================================================================

/// Unique key of a post: `(instance, post_id)`
///
/// The display form `instance:post_id` is the canonical boundary
/// representation; adapters store both halves verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostKey {
    /// Host name of the instance that serves the post
    pub instance: String,
    /// Post identifier as assigned by that instance
    pub post_id: String,
}

impl PostKey {
    /// Create a key from its two halves
    pub fn new(instance: impl Into<String>, post_id: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            post_id: post_id.into(),
        }
    }

    /// Parse the `instance:post_id` display form.
    ///
    /// Accepts upstream-shaped keys (instance containing a dot, id of
    /// `[A-Za-z0-9_-]`) and this service's synthetic shape (`corgi:<id>`).
    pub fn parse(s: &str) -> Option<Self> {
        let (instance, post_id) = s.split_once(':')?;
        if post_id.is_empty() || instance.is_empty() {
            return None;
        }
        if !post_id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
            return None;
        }
        let upstream_shaped = instance.contains('.')
            && instance
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-');
        if upstream_shaped || instance == SYNTHETIC_INSTANCE {
            Some(Self::new(instance, post_id))
        } else {
            None
        }
    }
}

impl fmt::Display for PostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.post_id)
    }
}

/// Engagement counters cached from upstream.
///
/// Refreshed opportunistically; never authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementCounts {
    /// Favourites (stars)
    pub favourites: u64,
    /// Reblogs (boosts)
    pub reblogs: u64,
    /// Replies
    pub replies: u64,
}

impl EngagementCounts {
    /// Weighted engagement used by trending and the engagement sub-score
    pub fn weighted(&self) -> f64 {
        self.favourites as f64 + 2.0 * self.reblogs as f64 + 1.5 * self.replies as f64
    }

    /// Field-wise maximum; used when merging counter refreshes
    pub fn merge_max(&self, other: &EngagementCounts) -> EngagementCounts {
        EngagementCounts {
            favourites: self.favourites.max(other.favourites),
            reblogs: self.reblogs.max(other.reblogs),
            replies: self.replies.max(other.replies),
        }
    }
}

/// How the crawler found a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    /// Public (federated or local) timeline
    Timeline,
    /// Hashtag timeline
    Hashtag,
    /// An author's recent posts
    Account,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeline => write!(f, "timeline"),
            Self::Hashtag => write!(f, "hashtag"),
            Self::Account => write!(f, "account"),
        }
    }
}

/// Discovery metadata stamped on first insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMeta {
    /// Which source produced the post
    pub source: DiscoverySource,
    /// When the crawler first saw it
    pub discovered_at: DateTime<Utc>,
    /// Specific trail, e.g. the hashtag or author handle
    pub reason: String,
}

/// Media attachment descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Attachment type as reported by upstream (image, video, …)
    pub kind: String,
    /// Attachment URL
    pub url: String,
    /// Alt text when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A crawled post; the corpus is a cache of what upstream serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Unique key
    pub key: PostKey,
    /// Author handle, `user@instance`
    pub author: String,
    /// HTML-ish content as upstream served it
    pub content: String,
    /// Creation timestamp from upstream
    pub created_at: DateTime<Utc>,
    /// Detected language tag, when detection succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Confidence of the language detection, in [0,1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_confidence: Option<f64>,
    /// Hashtags, lowercased without `#`
    #[serde(default)]
    pub tags: Vec<String>,
    /// Cached engagement counters
    #[serde(default)]
    pub engagement: EngagementCounts,
    /// Media descriptors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaDescriptor>,
    /// Discovery metadata
    pub discovery: DiscoveryMeta,
}

impl Post {
    /// Trending score: weighted engagement damped by age
    pub fn trending_score(&self, now: DateTime<Utc>) -> f64 {
        let age = now.signed_duration_since(self.created_at);
        let recency_factor = if age.num_hours() <= 24 {
            1.0
        } else if age.num_days() <= 7 {
            0.8
        } else {
            0.5
        };
        self.engagement.weighted() * recency_factor
    }
}

// ============================================================================
// Interactions
// ============================================================================

/// Toggle families group an action with its inverse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFamily {
    /// favorite / unfavorite
    Favourite,
    /// reblog / unreblog
    Reblog,
    /// bookmark / unbookmark
    Bookmark,
    /// reply
    Reply,
    /// view
    View,
    /// more_like_this / less_like_this
    Preference,
}

/// Allowed interaction actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    /// Favourite (star)
    Favorite,
    /// Undo a favourite
    Unfavorite,
    /// Reblog (boost)
    Reblog,
    /// Undo a reblog
    Unreblog,
    /// Reply
    Reply,
    /// Bookmark
    Bookmark,
    /// Undo a bookmark
    Unbookmark,
    /// Passive view
    View,
    /// Explicit positive feedback
    MoreLikeThis,
    /// Explicit negative feedback
    LessLikeThis,
}

impl InteractionAction {
    /// Parse an action string, normalizing synonyms before the membership
    /// check (`share`→`reblog`, `comment`→`reply`, `click`→`view`).
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = match raw {
            "share" => "reblog",
            "comment" => "reply",
            "click" => "view",
            other => other,
        };
        match normalized {
            "favorite" | "favourite" => Some(Self::Favorite),
            "unfavorite" | "unfavourite" => Some(Self::Unfavorite),
            "reblog" => Some(Self::Reblog),
            "unreblog" => Some(Self::Unreblog),
            "reply" => Some(Self::Reply),
            "bookmark" => Some(Self::Bookmark),
            "unbookmark" => Some(Self::Unbookmark),
            "view" => Some(Self::View),
            "more_like_this" => Some(Self::MoreLikeThis),
            "less_like_this" => Some(Self::LessLikeThis),
            _ => None,
        }
    }

    /// Canonical wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Favorite => "favorite",
            Self::Unfavorite => "unfavorite",
            Self::Reblog => "reblog",
            Self::Unreblog => "unreblog",
            Self::Reply => "reply",
            Self::Bookmark => "bookmark",
            Self::Unbookmark => "unbookmark",
            Self::View => "view",
            Self::MoreLikeThis => "more_like_this",
            Self::LessLikeThis => "less_like_this",
        }
    }

    /// The family this action toggles within
    pub fn family(&self) -> ActionFamily {
        match self {
            Self::Favorite | Self::Unfavorite => ActionFamily::Favourite,
            Self::Reblog | Self::Unreblog => ActionFamily::Reblog,
            Self::Bookmark | Self::Unbookmark => ActionFamily::Bookmark,
            Self::Reply => ActionFamily::Reply,
            Self::View => ActionFamily::View,
            Self::MoreLikeThis | Self::LessLikeThis => ActionFamily::Preference,
        }
    }

    /// Whether the action asserts (rather than retracts) its family state
    pub fn is_assertion(&self) -> bool {
        !matches!(self, Self::Unfavorite | Self::Unreblog | Self::Unbookmark | Self::LessLikeThis)
    }

    /// Whether the action signals positive affinity toward the author.
    /// Views only count when the deployment opts in.
    pub fn is_positive(&self, views_are_positive: bool) -> bool {
        match self {
            Self::Favorite | Self::Reblog | Self::Reply | Self::Bookmark | Self::MoreLikeThis => {
                true
            }
            Self::View => views_are_positive,
            _ => false,
        }
    }
}

/// A recorded interaction. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Insert-order id assigned by the store; breaks timestamp ties
    pub id: i64,
    /// Pseudonymous actor
    pub alias: UserAlias,
    /// Target post
    pub post_key: PostKey,
    /// What happened
    pub action: InteractionAction,
    /// Server-assigned timestamp, monotonic per alias
    pub created_at: DateTime<Utc>,
    /// Optional sanitized context object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// An interaction about to be appended (no id or timestamp yet)
#[derive(Debug, Clone)]
pub struct NewInteraction {
    /// Pseudonymous actor
    pub alias: UserAlias,
    /// Target post
    pub post_key: PostKey,
    /// What happened
    pub action: InteractionAction,
    /// Optional sanitized context object
    pub context: Option<Value>,
}

/// Effective toggle state for one `(alias, post)` pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleState {
    /// Most recent favourite-family record is an assertion
    pub favourited: bool,
    /// Most recent reblog-family record is an assertion
    pub reblogged: bool,
    /// Most recent bookmark-family record is an assertion
    pub bookmarked: bool,
}

/// Fold an interaction history into its effective toggle state.
///
/// The effective state of each family is the most recent record in that
/// family; records must be supplied in `(created_at, id)` order, which is
/// the order every store adapter returns.
pub fn effective_toggle_state(history: &[Interaction]) -> ToggleState {
    let mut state = ToggleState::default();
    for record in history {
        match record.action.family() {
            ActionFamily::Favourite => state.favourited = record.action.is_assertion(),
            ActionFamily::Reblog => state.reblogged = record.action.is_assertion(),
            ActionFamily::Bookmark => state.bookmarked = record.action.is_assertion(),
            _ => {}
        }
    }
    state
}

/// Engagement state returned after recording an interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementState {
    /// Target post
    pub post_key: PostKey,
    /// Effective toggles for the acting alias
    #[serde(flatten)]
    pub toggles: ToggleState,
    /// Cached counters for the post
    #[serde(flatten)]
    pub counts: EngagementCounts,
}

// ============================================================================
// Affinity and rankings
// ============================================================================

/// Per-author interaction summary for one alias
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorAffinity {
    /// Positive interactions with the author
    pub positive: u64,
    /// All interactions with the author
    pub total: u64,
}

impl AuthorAffinity {
    /// Laplace-smoothed affinity score in [0,1); 0 for unknown authors
    pub fn score(&self, alpha: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.positive as f64 / (self.total as f64 + alpha)
    }
}

/// Build the author-affinity map in a single pass over an alias's history
pub fn author_affinity(
    history: &[Interaction],
    author_of: &HashMap<PostKey, String>,
    views_are_positive: bool,
) -> HashMap<String, AuthorAffinity> {
    let mut map: HashMap<String, AuthorAffinity> = HashMap::new();
    for record in history {
        let Some(author) = author_of.get(&record.post_key) else {
            continue;
        };
        let entry = map.entry(author.clone()).or_default();
        entry.total += 1;
        if record.action.is_positive(views_are_positive) {
            entry.positive += 1;
        }
    }
    map
}

/// Why a post was recommended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    /// The alias engages positively with this author
    AuthorAffinity,
    /// The post is widely engaged with
    Engagement,
    /// The post is fresh
    Recency,
    /// Language or tag overlap with the alias's recent positives
    ContentAffinity,
    /// Cold-start trending selection
    Trending,
    /// Diversity injection outside the alias's usual signals
    Serendipity,
}

impl fmt::Display for ReasonCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AuthorAffinity => "author_affinity",
            Self::Engagement => "engagement",
            Self::Recency => "recency",
            Self::ContentAffinity => "content_affinity",
            Self::Trending => "trending",
            Self::Serendipity => "serendipity",
        };
        write!(f, "{}", s)
    }
}

/// A scored recommendation persisted per alias per generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRecord {
    /// Alias the ranking was generated for
    pub alias: UserAlias,
    /// Recommended post
    pub post_key: PostKey,
    /// Final score, clipped to [0,1]
    pub score: f64,
    /// Largest-contributing sub-score
    pub reason_category: ReasonCategory,
    /// Specific token: author handle, hashtag, …
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_detail: Option<String>,
    /// Shared by every record of one pipeline run
    pub generated_at: DateTime<Utc>,
}

// ============================================================================
// Boundary records
// ============================================================================

/// Token-to-alias mapping, written by the out-of-scope identity component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMapping {
    /// Alias the token resolves to
    pub alias: UserAlias,
    /// Instance the token authenticates against
    pub instance: String,
    /// The opaque upstream token
    pub token: String,
    /// Optional expiry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenMapping {
    /// Whether the mapping is past its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

// ============================================================================
// Timeline rendering
// ============================================================================

/// Render a corpus post as a Mastodon-shaped status object with the
/// augmentation fields attached. Compliant upstream clients ignore the
/// extra fields.
pub fn post_to_status(post: &Post, ranking: &RankingRecord) -> Value {
    let (username, _) = post.author.split_once('@').unwrap_or((post.author.as_str(), ""));
    serde_json::json!({
        "id": post.key.to_string(),
        "uri": format!("https://{}/statuses/{}", post.key.instance, post.key.post_id),
        "content": post.content,
        "created_at": post.created_at.to_rfc3339(),
        "language": post.language,
        "account": {
            "acct": post.author,
            "username": username,
        },
        "favourites_count": post.engagement.favourites,
        "reblogs_count": post.engagement.reblogs,
        "replies_count": post.engagement.replies,
        "tags": post.tags.iter().map(|t| serde_json::json!({"name": t})).collect::<Vec<_>>(),
        "media_attachments": post.media.iter().map(|m| serde_json::json!({
            "type": m.kind,
            "url": m.url,
            "description": m.description,
        })).collect::<Vec<_>>(),
        "is_recommendation": true,
        "reason_category": ranking.reason_category.to_string(),
        "reason_detail": ranking.reason_detail,
        "score": ranking.score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(id: &str) -> PostKey {
        PostKey::new("mastodon.social", id)
    }

    fn record(id: i64, action: InteractionAction, secs: i64) -> Interaction {
        Interaction {
            id,
            alias: UserAlias::anonymous(),
            post_key: key("1"),
            action,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            context: None,
        }
    }

    #[test]
    fn post_key_parses_upstream_and_synthetic_shapes() {
        assert_eq!(
            PostKey::parse("mastodon.social:109384"),
            Some(PostKey::new("mastodon.social", "109384"))
        );
        assert_eq!(
            PostKey::parse("corgi:seed-7"),
            Some(PostKey::new("corgi", "seed-7"))
        );
        assert_eq!(PostKey::parse("nodots:123"), None);
        assert_eq!(PostKey::parse("mastodon.social:"), None);
        assert_eq!(PostKey::parse("mastodon.social:has space"), None);
        assert_eq!(PostKey::parse("plain"), None);
    }

    #[test]
    fn synonyms_normalize_before_membership() {
        assert_eq!(InteractionAction::parse("share"), Some(InteractionAction::Reblog));
        assert_eq!(InteractionAction::parse("comment"), Some(InteractionAction::Reply));
        assert_eq!(InteractionAction::parse("click"), Some(InteractionAction::View));
        assert_eq!(InteractionAction::parse("poke"), None);
    }

    #[test]
    fn toggle_state_is_most_recent_per_family() {
        let history = vec![
            record(1, InteractionAction::Favorite, 0),
            record(2, InteractionAction::Reblog, 1),
            record(3, InteractionAction::Unfavorite, 2),
            record(4, InteractionAction::Favorite, 3),
            record(5, InteractionAction::Unreblog, 4),
        ];
        let state = effective_toggle_state(&history);
        assert!(state.favourited);
        assert!(!state.reblogged);
        assert!(!state.bookmarked);
    }

    #[test]
    fn duplicate_records_do_not_change_effective_state() {
        // At-least-once ingestion: replaying the same favourite leaves the
        // effective state unchanged.
        let mut history = vec![record(1, InteractionAction::Favorite, 0)];
        let once = effective_toggle_state(&history);
        history.push(record(2, InteractionAction::Favorite, 0));
        assert_eq!(once, effective_toggle_state(&history));
    }

    #[test]
    fn affinity_smoothing_and_unknown_author() {
        let affinity = AuthorAffinity { positive: 5, total: 5 };
        assert!((affinity.score(5.0) - 0.5).abs() < 1e-9);
        assert_eq!(AuthorAffinity::default().score(5.0), 0.0);
    }

    #[test]
    fn affinity_is_single_pass_over_history() {
        let mut author_of = HashMap::new();
        author_of.insert(key("1"), "ada@mastodon.social".to_string());

        let history = vec![
            record(1, InteractionAction::Favorite, 0),
            record(2, InteractionAction::View, 1),
            record(3, InteractionAction::LessLikeThis, 2),
        ];

        let map = author_affinity(&history, &author_of, false);
        let entry = map.get("ada@mastodon.social").unwrap();
        assert_eq!(entry.total, 3);
        assert_eq!(entry.positive, 1);

        // Views flip to positive only when the deployment opts in.
        let map = author_affinity(&history, &author_of, true);
        assert_eq!(map.get("ada@mastodon.social").unwrap().positive, 2);
    }

    #[test]
    fn trending_recency_factors() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut post = Post {
            key: key("1"),
            author: "ada@mastodon.social".to_string(),
            content: String::new(),
            created_at: now - chrono::Duration::hours(2),
            language: None,
            language_confidence: None,
            tags: vec![],
            engagement: EngagementCounts { favourites: 10, reblogs: 0, replies: 0 },
            media: vec![],
            discovery: DiscoveryMeta {
                source: DiscoverySource::Timeline,
                discovered_at: now,
                reason: "public".to_string(),
            },
        };
        assert!((post.trending_score(now) - 10.0).abs() < 1e-9);

        post.created_at = now - chrono::Duration::days(3);
        assert!((post.trending_score(now) - 8.0).abs() < 1e-9);

        post.created_at = now - chrono::Duration::days(10);
        assert!((post.trending_score(now) - 5.0).abs() < 1e-9);
    }
}
