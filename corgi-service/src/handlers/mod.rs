//! HTTP handlers for the mounted endpoints

use serde_json::Value;
use std::collections::HashMap;

use crate::models::{post_to_status, Post, PostKey, RankingRecord, SYNTHETIC_INSTANCE};
use crate::ranking::coldstart;
use crate::store::Store;

pub mod health;
pub mod interactions;
pub mod recommendations;
pub mod timelines;

/// Header reporting found/requested on batch routes
pub const SUCCESS_RATE_HEADER: &str = "x-corgi-success-rate";

/// Hydrate ranking records into renderable statuses. Records whose posts
/// left the corpus are dropped; synthetic seed keys hydrate from the
/// embedded seed list.
pub async fn hydrate_records(
    store: &dyn Store,
    records: &[RankingRecord],
) -> Vec<(RankingRecord, Post)> {
    let keys: Vec<PostKey> = records.iter().map(|r| r.post_key.clone()).collect();
    let mut posts: HashMap<PostKey, Post> = match store.get_posts(&keys).await {
        Ok(posts) => posts.into_iter().map(|p| (p.key.clone(), p)).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "record hydration failed");
            HashMap::new()
        }
    };

    if records
        .iter()
        .any(|r| r.post_key.instance == SYNTHETIC_INSTANCE)
    {
        for seed in coldstart::seed_posts() {
            posts.entry(seed.key.clone()).or_insert(seed);
        }
    }

    records
        .iter()
        .filter_map(|record| {
            posts
                .get(&record.post_key)
                .map(|post| (record.clone(), post.clone()))
        })
        .collect()
}

/// Render hydrated records as Mastodon-shaped statuses with augmentation
/// fields
pub fn render_statuses(pairs: &[(RankingRecord, Post)]) -> Vec<Value> {
    pairs
        .iter()
        .map(|(record, post)| post_to_status(post, record))
        .collect()
}
