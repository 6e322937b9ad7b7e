//! Interaction logging and batch engagement counts

use axum::{
    extract::{Extension, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;

use crate::cache::{engagement_key, CachedResponse, ContentClass};
use crate::error::{Error, Result};
use crate::identity::ResolvedIdentity;
use crate::interactions::{self, InteractionSubmission};
use crate::models::{EngagementCounts, PostKey};
use crate::pagination::MAX_LIMIT;
use crate::proxy::{self, build_response, EndpointClass};
use crate::state::AppState;

use super::SUCCESS_RATE_HEADER;

/// `POST /api/v1/interactions`
pub async fn submit(
    State(state): State<AppState>,
    Extension(identity): Extension<ResolvedIdentity>,
    Json(submission): Json<InteractionSubmission>,
) -> Response {
    let started = Instant::now();

    let result = interactions::record(
        state.store().as_ref(),
        state.cache(),
        state.rankings(),
        &state.config().interactions,
        &identity.alias,
        submission,
    )
    .await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    proxy::emit_call_metrics(
        EndpointClass::Interactions,
        &identity.instance,
        identity.tier.as_str(),
        outcome,
        None,
        started.elapsed().as_millis(),
        false,
    );

    match result {
        Ok(engagement) => (StatusCode::OK, Json(engagement)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Query shape for the batch counts endpoint
#[derive(Debug, Deserialize)]
pub struct BatchCountsQuery {
    /// Comma-separated post keys
    pub ids: String,
}

/// `GET /api/v1/interactions/counts/batch`
pub async fn batch_counts(
    State(state): State<AppState>,
    Extension(identity): Extension<ResolvedIdentity>,
    Query(query): Query<BatchCountsQuery>,
) -> Response {
    match batch_counts_inner(&state, &identity, &query).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn batch_counts_inner(
    state: &AppState,
    identity: &ResolvedIdentity,
    query: &BatchCountsQuery,
) -> Result<Response> {
    let started = Instant::now();

    let keys: Vec<PostKey> = query
        .ids
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| PostKey::parse(t).ok_or_else(|| Error::validation("ids", "malformed post key")))
        .collect::<Result<_>>()?;

    if keys.is_empty() || keys.len() > MAX_LIMIT {
        return Err(Error::validation("ids", "expected between 1 and 100 post keys"));
    }

    // Read through the per-post engagement cache; misses fall back to one
    // bulk corpus fetch.
    let mut counts: Vec<(PostKey, Option<EngagementCounts>)> = Vec::with_capacity(keys.len());
    let mut misses: Vec<PostKey> = Vec::new();
    for key in &keys {
        match state.cache().get(&engagement_key(key)).await {
            Some(cached) => {
                let parsed = serde_json::from_slice(&cached.body).ok();
                if parsed.is_none() {
                    misses.push(key.clone());
                }
                counts.push((key.clone(), parsed));
            }
            None => {
                misses.push(key.clone());
                counts.push((key.clone(), None));
            }
        }
    }

    if !misses.is_empty() {
        let fetched = state.store().get_posts(&misses).await?;
        for post in fetched {
            state
                .cache()
                .put(
                    &engagement_key(&post.key),
                    ContentClass::Default,
                    CachedResponse {
                        status: 200,
                        content_type: "application/json".to_string(),
                        body: serde_json::to_vec(&post.engagement).unwrap_or_default(),
                        link: None,
                    },
                )
                .await;
            for slot in counts.iter_mut() {
                if slot.0 == post.key && slot.1.is_none() {
                    slot.1 = Some(post.engagement);
                }
            }
        }
    }

    let found = counts.iter().filter(|(_, c)| c.is_some()).count();
    let success_rate = found as f64 / keys.len() as f64;

    let body: serde_json::Map<String, serde_json::Value> = counts
        .iter()
        .filter_map(|(key, counts)| {
            counts.map(|c| {
                (
                    key.to_string(),
                    json!({
                        "favourites": c.favourites,
                        "reblogs": c.reblogs,
                        "replies": c.replies,
                    }),
                )
            })
        })
        .collect();

    proxy::emit_call_metrics(
        EndpointClass::InteractionCounts,
        &identity.instance,
        identity.tier.as_str(),
        "ok",
        None,
        started.elapsed().as_millis(),
        misses.is_empty(),
    );

    let mut response = build_response(
        StatusCode::OK,
        "application/json",
        serde_json::to_vec(&json!({ "counts": body })).unwrap_or_default(),
        None,
        "cache",
    );
    if let Ok(value) = format!("{success_rate:.2}").parse() {
        response.headers_mut().insert(SUCCESS_RATE_HEADER, value);
    }
    Ok(response)
}
