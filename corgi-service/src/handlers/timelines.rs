//! Timeline handlers: forwarded home (with injection), forwarded public,
//! and the recommended timeline served from the ranking engine

use axum::{
    extract::{Extension, Query, RawQuery, State},
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Instant;

use crate::cache::{fingerprint, CachedResponse};
use crate::error::{Error, Result};
use crate::identity::ResolvedIdentity;
use crate::injector::{self, InjectionStrategy};
use crate::models::PostKey;
use crate::pagination::{self, link_header, paginate, parse_languages, validate_limit, validate_min_score};
use crate::proxy::{self, build_response, cache_relevant_params, skip_cache, EndpointClass};
use crate::ranking::RankingRequest;
use crate::state::AppState;

use super::{hydrate_records, render_statuses};

/// Query parameters accepted by the timeline endpoints
#[derive(Debug, Default, Deserialize)]
pub struct TimelineQuery {
    /// Page size, bounded to [0, 100]
    pub limit: Option<i64>,
    /// Return items after this id
    pub max_id: Option<String>,
    /// Return items before this id
    pub since_id: Option<String>,
    /// Minimum score, [0.0, 1.0]
    pub min_score: Option<f64>,
    /// Comma-separated language tags
    pub languages: Option<String>,
    /// Comma-separated post keys to exclude
    pub exclude_ids: Option<String>,
}

/// `GET /api/v1/timelines/home`: forward upstream, then inject
pub async fn home(
    State(state): State<AppState>,
    Extension(identity): Extension<ResolvedIdentity>,
    RawQuery(raw): RawQuery,
) -> Response {
    let started = Instant::now();
    let class = EndpointClass::HomeTimeline;
    let path = "/api/v1/timelines/home";

    let fetched = proxy::fetch_upstream_page(&state, &identity, class, path, raw.as_deref()).await;

    match fetched {
        Ok((upstream, cache_hit)) => {
            if upstream.status != 200 {
                // Non-5xx upstream answers (401, 410, ...) forward verbatim.
                return build_response(
                    StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY),
                    &upstream.content_type,
                    upstream.body,
                    upstream.link.as_deref(),
                    "upstream",
                );
            }

            let page: Vec<Value> = match upstream.json() {
                Ok(Value::Array(items)) => items,
                _ => Vec::new(),
            };

            let merged = augment_home_page(&state, &identity, page).await;

            proxy::emit_call_metrics(
                class,
                &identity.instance,
                identity.tier.as_str(),
                "ok",
                None,
                started.elapsed().as_millis(),
                cache_hit,
            );

            let (body, link, source) = match merged {
                AugmentedPage::Merged(items) => (
                    serde_json::to_vec(&items).unwrap_or_default(),
                    upstream.link.clone(),
                    if cache_hit { "cache" } else { "upstream" },
                ),
                AugmentedPage::InjectedOnly { items, more } => {
                    // Empty upstream page: every item is an injected
                    // recommendation, and cursors operate on upstream ids
                    // only. When more recommendations remain, the Link
                    // points at the recommended timeline without cursor
                    // parameters instead of naming a recommendation id.
                    let link = more.then(|| {
                        format!(
                            "</api/v1/timelines/recommended?limit={}>; rel=\"next\"",
                            pagination::DEFAULT_LIMIT
                        )
                    });
                    (
                        serde_json::to_vec(&items).unwrap_or_default(),
                        link,
                        "recommended",
                    )
                }
            };

            build_response(StatusCode::OK, "application/json", body, link.as_deref(), source)
        }
        Err(e @ (Error::Upstream { .. } | Error::Timeout)) => {
            // Graceful degradation: a cold-start page instead of the failure.
            tracing::warn!(error = %e, "home timeline upstream failed; serving cold start");
            let records = state
                .rankings()
                .rankings_for(&RankingRequest::plain(
                    identity.alias.clone(),
                    pagination::DEFAULT_LIMIT,
                ))
                .await
                .unwrap_or_default();
            let pairs = hydrate_records(state.store().as_ref(), &records).await;
            let statuses = render_statuses(&pairs);

            proxy::emit_call_metrics(
                class,
                &identity.instance,
                identity.tier.as_str(),
                "cold_start",
                None,
                started.elapsed().as_millis(),
                false,
            );

            build_response(
                StatusCode::OK,
                "application/json",
                serde_json::to_vec(&statuses).unwrap_or_default(),
                None,
                "cold_start",
            )
        }
        Err(e) => e.into_response(),
    }
}

/// `GET /api/v1/timelines/public`: forward, never inject
pub async fn public(
    State(state): State<AppState>,
    Extension(identity): Extension<ResolvedIdentity>,
    RawQuery(raw): RawQuery,
) -> Response {
    let started = Instant::now();
    let class = EndpointClass::PublicTimeline;

    match proxy::fetch_upstream_page(
        &state,
        &identity,
        class,
        "/api/v1/timelines/public",
        raw.as_deref(),
    )
    .await
    {
        Ok((upstream, cache_hit)) => {
            proxy::emit_call_metrics(
                class,
                &identity.instance,
                identity.tier.as_str(),
                "ok",
                None,
                started.elapsed().as_millis(),
                cache_hit,
            );
            build_response(
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY),
                &upstream.content_type,
                upstream.body,
                upstream.link.as_deref(),
                if cache_hit { "cache" } else { "upstream" },
            )
        }
        Err(e) => e.into_response(),
    }
}

/// `GET /api/v1/timelines/recommended`: this service's own timeline
pub async fn recommended(
    State(state): State<AppState>,
    Extension(identity): Extension<ResolvedIdentity>,
    Query(query): Query<TimelineQuery>,
    RawQuery(raw): RawQuery,
) -> Response {
    match recommended_inner(&state, &identity, &query, raw.as_deref()).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn recommended_inner(
    state: &AppState,
    identity: &ResolvedIdentity,
    query: &TimelineQuery,
    raw: Option<&str>,
) -> Result<Response> {
    let started = Instant::now();
    let class = EndpointClass::RecommendedTimeline;
    let path = "/api/v1/timelines/recommended";

    let limit = validate_limit(query.limit)?;
    let min_score = validate_min_score(query.min_score)?;
    let languages = parse_languages(query.languages.as_deref());
    let exclude = parse_exclude_ids(query.exclude_ids.as_deref())?;

    let source = if identity.alias.is_anonymous() {
        "cold_start"
    } else {
        "recommended"
    };

    if limit == 0 {
        return Ok(build_response(
            StatusCode::OK,
            "application/json",
            b"[]".to_vec(),
            None,
            source,
        ));
    }

    let bypass = skip_cache(raw);
    let cache_key = if bypass {
        None
    } else {
        Some(fingerprint(
            class.as_str(),
            "GET",
            path,
            &cache_relevant_params(raw),
            Some(&identity.alias),
            &identity.instance,
        ))
    };

    if let Some(key) = &cache_key {
        if let Some(cached) = state.cache().get(key).await {
            proxy::emit_call_metrics(
                class,
                &identity.instance,
                identity.tier.as_str(),
                "ok",
                None,
                started.elapsed().as_millis(),
                true,
            );
            return Ok(build_response(
                StatusCode::OK,
                &cached.content_type,
                cached.body,
                cached.link.as_deref(),
                "cache",
            ));
        }
    }

    let request = RankingRequest {
        alias: identity.alias.clone(),
        limit: pagination::MAX_LIMIT,
        min_score,
        exclude,
        languages,
        model_id: None,
        diversity: false,
    };
    let records = state.rankings().rankings_for(&request).await?;

    let page = paginate(
        &records,
        |r| r.post_key.to_string(),
        query.max_id.as_deref(),
        query.since_id.as_deref(),
        limit,
    );

    let pairs = hydrate_records(state.store().as_ref(), &page.items).await;
    let statuses = render_statuses(&pairs);

    let first_id = page.items.first().map(|r| r.post_key.to_string());
    let last_id = page.items.last().map(|r| r.post_key.to_string());
    let link = link_header(
        path,
        limit,
        first_id.as_deref(),
        last_id.as_deref(),
        page.has_next,
        page.has_prev,
    );

    let body = serde_json::to_vec(&statuses).unwrap_or_default();

    if let Some(key) = &cache_key {
        state
            .cache()
            .put(
                key,
                class.cache_class(),
                CachedResponse {
                    status: 200,
                    content_type: "application/json".to_string(),
                    body: body.clone(),
                    link: link.clone(),
                },
            )
            .await;
    }

    proxy::emit_call_metrics(
        class,
        &identity.instance,
        identity.tier.as_str(),
        "ok",
        None,
        started.elapsed().as_millis(),
        false,
    );

    Ok(build_response(
        StatusCode::OK,
        "application/json",
        body,
        link.as_deref(),
        source,
    ))
}

enum AugmentedPage {
    /// Upstream posts with recommendations woven in
    Merged(Vec<Value>),
    /// Upstream page was empty; the page is recommendations alone
    InjectedOnly {
        items: Vec<Value>,
        /// More recommendations remain beyond this page
        more: bool,
    },
}

async fn augment_home_page(
    state: &AppState,
    identity: &ResolvedIdentity,
    page: Vec<Value>,
) -> AugmentedPage {
    let injection = &state.config().injection;

    let mut request = RankingRequest::plain(identity.alias.clone(), pagination::DEFAULT_LIMIT);
    request.diversity = true;
    let records = match state.rankings().rankings_for(&request).await {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(error = %e, "recommendations unavailable; forwarding unmodified");
            return AugmentedPage::Merged(page);
        }
    };

    let pairs = hydrate_records(state.store().as_ref(), &records).await;
    let injections = render_statuses(&pairs);

    let strategy = InjectionStrategy::parse(&injection.strategy);
    let merged = injector::inject(
        &page,
        &injections,
        strategy,
        injection.max_injections,
        injection.gap,
    );

    if page.is_empty() {
        let more = injections.len() > merged.len();
        AugmentedPage::InjectedOnly {
            items: merged,
            more,
        }
    } else {
        AugmentedPage::Merged(merged)
    }
}

fn parse_exclude_ids(raw: Option<&str>) -> Result<Vec<PostKey>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut keys = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match PostKey::parse(token) {
            Some(key) => keys.push(key),
            None => {
                return Err(Error::validation("exclude_ids", "malformed post key"));
            }
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_ids_parse_or_reject() {
        assert!(parse_exclude_ids(None).unwrap().is_empty());
        let keys = parse_exclude_ids(Some("mastodon.social:1, corgi:seed-2")).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(parse_exclude_ids(Some("bogus")).is_err());
    }
}
