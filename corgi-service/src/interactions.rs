//! Interaction pipeline: validate, sanitize, persist, invalidate
//!
//! Ingestion is at-least-once: the log is append-only and idempotence lives
//! at the effective-state layer, where the most recent record per toggle
//! family wins. The pipeline itself never retries; persistence failures
//! surface as `store_error` and the client retries.

use serde::Deserialize;
use serde_json::Value;

use crate::cache::CacheService;
use crate::config::InteractionsConfig;
use crate::error::{Error, Result};
use crate::identity::UserAlias;
use crate::models::{
    effective_toggle_state, EngagementState, InteractionAction, NewInteraction, PostKey,
};
use crate::ranking::RankingService;
use crate::sanitize;
use crate::store::Store;

/// Wire shape of a logged interaction
#[derive(Debug, Clone, Deserialize)]
pub struct InteractionSubmission {
    /// Target post in `instance:post_id` form
    pub post_id: String,
    /// Action name; synonyms are normalized before validation
    pub action: String,
    /// Optional context object
    #[serde(default)]
    pub context: Option<Value>,
}

/// Record one interaction and return the post's new effective state.
pub async fn record(
    store: &dyn Store,
    cache: &CacheService,
    rankings: &RankingService,
    config: &InteractionsConfig,
    alias: &UserAlias,
    submission: InteractionSubmission,
) -> Result<EngagementState> {
    if alias.is_anonymous() && !config.allow_anonymous {
        return Err(Error::AuthRequired);
    }

    let action = InteractionAction::parse(&submission.action)
        .ok_or_else(|| Error::validation("action", "unknown action"))?;

    let post_key = PostKey::parse(&submission.post_id)
        .ok_or_else(|| Error::validation("post_id", "malformed post key"))?;

    let context = match submission.context {
        Some(context) => {
            sanitize::check_context(&context, config.max_context_depth, config.max_text_len)?;
            Some(context)
        }
        None => None,
    };

    // Append-only persistence; the store assigns the timestamp.
    store
        .append_interaction(&NewInteraction {
            alias: alias.clone(),
            post_key: post_key.clone(),
            action,
            context,
        })
        .await?;

    // Side effects: the alias's rankings and cached responses are stale, as
    // is the post's engagement-counter entry. Author affinity is implicitly
    // dirty and recomputes at the next pre-aggregation.
    rankings.invalidate(alias);
    cache.invalidate_alias(alias).await;
    cache.invalidate_engagement(&post_key).await;

    effective_state(store, alias, &post_key).await
}

/// Current effective engagement state for `(alias, post)`
pub async fn effective_state(
    store: &dyn Store,
    alias: &UserAlias,
    post_key: &PostKey,
) -> Result<EngagementState> {
    let history = store.interactions_for_alias_post(alias, post_key).await?;
    let toggles = effective_toggle_state(&history);

    let counts = store
        .get_posts(std::slice::from_ref(post_key))
        .await?
        .into_iter()
        .next()
        .map(|p| p.engagement)
        .unwrap_or_default();

    Ok(EngagementState {
        post_key: post_key.clone(),
        toggles,
        counts,
    })
}
