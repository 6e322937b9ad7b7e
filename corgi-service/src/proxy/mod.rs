//! Transparent proxy with augmentation hooks
//!
//! The dispatch order is: mount-point endpoints owned by this service
//! (routed explicitly in [`crate::server`]), augmentation-eligible
//! endpoints (home timeline, recommended, interactions; also explicit
//! routes), and finally this module's pass-through fallback, which forwards
//! anything else verbatim to the identity's upstream instance with caching
//! and metrics headers.

use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use http::{HeaderValue, StatusCode};
use std::time::Instant;

use crate::cache::{fingerprint, CachedResponse, ContentClass};
use crate::error::{Error, Result};
use crate::identity::ResolvedIdentity;
use crate::state::AppState;

pub mod client;

pub use client::{UpstreamClient, UpstreamResponse};

/// Marker for responses that already carry `X-Corgi-Source`
pub const SOURCE_HEADER: &str = "x-corgi-source";

/// Endpoint classes drive auth policy, caching, rate limiting, and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// `/api/v1/timelines/home`: forwarded and injected
    HomeTimeline,
    /// `/api/v1/timelines/public`: forwarded, never injected
    PublicTimeline,
    /// `/api/v1/timelines/recommended`: served by this service
    RecommendedTimeline,
    /// `/api/v1/recommendations`: ranking records only
    Recommendations,
    /// `/api/v1/interactions`: interaction logging
    Interactions,
    /// `/api/v1/interactions/counts/batch`: bulk engagement counts
    InteractionCounts,
    /// `/api/v1/accounts/...`
    Profile,
    /// `/api/v1/statuses/...`
    Status,
    /// `/api/v1/instance`, `/api/v2/instance`
    Instance,
    /// `/health`, `/ready`
    Health,
    /// Administrative surfaces; never cached, never proxied
    Admin,
    /// Anything else passing through
    Other,
}

impl EndpointClass {
    /// Classify a request path
    pub fn classify(path: &str) -> Self {
        if path == "/health" || path == "/ready" {
            Self::Health
        } else if path.starts_with("/api/v1/timelines/home") {
            Self::HomeTimeline
        } else if path.starts_with("/api/v1/timelines/public") {
            Self::PublicTimeline
        } else if path.starts_with("/api/v1/timelines/recommended") {
            Self::RecommendedTimeline
        } else if path.starts_with("/api/v1/recommendations") {
            Self::Recommendations
        } else if path.starts_with("/api/v1/interactions/counts") {
            Self::InteractionCounts
        } else if path.starts_with("/api/v1/interactions") {
            Self::Interactions
        } else if path.starts_with("/api/v1/accounts/") {
            Self::Profile
        } else if path.starts_with("/api/v1/statuses/") {
            Self::Status
        } else if path == "/api/v1/instance" || path == "/api/v2/instance" {
            Self::Instance
        } else if path.starts_with("/api/v1/admin") || path.starts_with("/admin") {
            Self::Admin
        } else {
            Self::Other
        }
    }

    /// Metrics and fingerprint label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HomeTimeline => "home_timeline",
            Self::PublicTimeline => "public_timeline",
            Self::RecommendedTimeline => "recommended_timeline",
            Self::Recommendations => "recommendations",
            Self::Interactions => "interactions",
            Self::InteractionCounts => "interaction_counts",
            Self::Profile => "profile",
            Self::Status => "status",
            Self::Instance => "instance",
            Self::Health => "health",
            Self::Admin => "admin",
            Self::Other => "other",
        }
    }

    /// Whether resolution failure must reject rather than degrade
    pub fn auth_required(&self) -> bool {
        matches!(self, Self::Interactions)
    }

    /// Whether an upstream failure may be answered from cold-start content
    pub fn cold_start_substitutable(&self) -> bool {
        matches!(
            self,
            Self::HomeTimeline | Self::RecommendedTimeline | Self::Recommendations
        )
    }

    /// Whether successful GET responses may be cached
    pub fn cacheable(&self) -> bool {
        !matches!(
            self,
            Self::Interactions | Self::InteractionCounts | Self::Admin | Self::Health
        )
    }

    /// Content class for TTL selection
    pub fn cache_class(&self) -> ContentClass {
        match self {
            Self::HomeTimeline | Self::PublicTimeline | Self::RecommendedTimeline => {
                ContentClass::Timeline
            }
            Self::Profile => ContentClass::Profile,
            Self::Instance => ContentClass::Instance,
            Self::Status => ContentClass::Status,
            _ => ContentClass::Default,
        }
    }

    /// Whether responses are scoped to the requesting alias
    pub fn user_scoped(&self) -> bool {
        matches!(
            self,
            Self::HomeTimeline
                | Self::RecommendedTimeline
                | Self::Recommendations
                | Self::Interactions
        )
    }
}

/// Parse a raw query string into pairs, dropping `skip_cache` (it controls
/// caching, it does not select content).
pub fn cache_relevant_params(raw_query: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw_query else {
        return Vec::new();
    };
    raw.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .filter(|(k, _)| k != "skip_cache")
        .collect()
}

/// Whether the request asked to bypass the cache in both directions
pub fn skip_cache(raw_query: Option<&str>) -> bool {
    cache_flag(raw_query, "skip_cache")
}

fn cache_flag(raw_query: Option<&str>, name: &str) -> bool {
    let Some(raw) = raw_query else {
        return false;
    };
    raw.split('&').any(|pair| {
        match pair.split_once('=') {
            Some((k, v)) => k == name && matches!(v, "1" | "true" | "yes"),
            None => pair == name,
        }
    })
}

/// Build a response from body bytes plus the corgi metrics headers
pub fn build_response(
    status: StatusCode,
    content_type: &str,
    body: Vec<u8>,
    link: Option<&str>,
    source: &str,
) -> Response {
    let mut response = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, content_type)
        .header(SOURCE_HEADER, source)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

    if let Some(link) = link {
        if let Ok(value) = HeaderValue::from_str(link) {
            response.headers_mut().insert(http::header::LINK, value);
        }
    }
    response
}

/// Structured per-call metrics record, emitted for every proxied request
#[allow(clippy::too_many_arguments)]
pub fn emit_call_metrics(
    endpoint_class: EndpointClass,
    instance: &str,
    tier: &str,
    outcome: &str,
    upstream_millis: Option<u128>,
    total_millis: u128,
    cache_hit: bool,
) {
    tracing::info!(
        endpoint_class = endpoint_class.as_str(),
        upstream_instance = instance,
        alias_tier = tier,
        outcome,
        upstream_latency_ms = upstream_millis.map(|m| m as u64),
        total_latency_ms = total_millis as u64,
        cache_hit,
        "proxied call"
    );
}

/// Pass-through fallback: forward verbatim, cache per policy, add headers
pub async fn passthrough(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();

    let identity = request
        .extensions()
        .get::<ResolvedIdentity>()
        .cloned()
        .unwrap_or_else(|| ResolvedIdentity::anonymous(&state.config().upstream.default_instance));

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let raw_query = request.uri().query().map(str::to_string);
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let headers = request.headers().clone();

    let class = EndpointClass::classify(&path);
    if class == EndpointClass::Admin {
        return Error::NotFound("admin".to_string()).into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), 2 * 1024 * 1024).await {
        Ok(bytes) if !bytes.is_empty() => Some(bytes.to_vec()),
        Ok(_) => None,
        Err(_) => {
            return Error::Validation {
                message: "request body too large".to_string(),
                fields: vec![],
            }
            .into_response()
        }
    };

    let bypass = skip_cache(raw_query.as_deref());
    let use_cache = method == http::Method::GET && class.cacheable() && !bypass;

    let cache_key = use_cache.then(|| {
        let params = cache_relevant_params(raw_query.as_deref());
        let alias = class.user_scoped().then_some(&identity.alias);
        fingerprint(
            class.as_str(),
            method.as_str(),
            &path,
            &params,
            alias,
            &identity.instance,
        )
    });

    if let Some(key) = &cache_key {
        if let Some(cached) = state.cache().get(key).await {
            emit_call_metrics(
                class,
                &identity.instance,
                identity.tier.as_str(),
                "ok",
                None,
                started.elapsed().as_millis(),
                true,
            );
            return build_response(
                StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
                &cached.content_type,
                cached.body,
                cached.link.as_deref(),
                "cache",
            );
        }
    }

    let upstream_started = Instant::now();
    let forwarded = state
        .upstream()
        .forward(
            method.clone(),
            &identity.instance,
            &path_and_query,
            &headers,
            body,
            identity.token.as_deref(),
        )
        .await;
    let upstream_millis = upstream_started.elapsed().as_millis();

    match forwarded {
        Ok(upstream) => {
            if let Some(key) = &cache_key {
                if upstream.status == 200 {
                    state
                        .cache()
                        .put(
                            key,
                            class.cache_class(),
                            CachedResponse {
                                status: upstream.status,
                                content_type: upstream.content_type.clone(),
                                body: upstream.body.clone(),
                                link: upstream.link.clone(),
                            },
                        )
                        .await;
                }
            }

            emit_call_metrics(
                class,
                &identity.instance,
                identity.tier.as_str(),
                "ok",
                Some(upstream_millis),
                started.elapsed().as_millis(),
                false,
            );

            build_response(
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY),
                &upstream.content_type,
                upstream.body,
                upstream.link.as_deref(),
                "upstream",
            )
        }
        Err(e) => {
            emit_call_metrics(
                class,
                &identity.instance,
                identity.tier.as_str(),
                e.code(),
                Some(upstream_millis),
                started.elapsed().as_millis(),
                false,
            );
            e.into_response()
        }
    }
}

/// Fetch an upstream page for an augmented endpoint, honoring the cache.
/// Returns the response plus whether it came from cache.
pub async fn fetch_upstream_page(
    state: &AppState,
    identity: &ResolvedIdentity,
    class: EndpointClass,
    path: &str,
    raw_query: Option<&str>,
) -> Result<(UpstreamResponse, bool)> {
    let bypass = skip_cache(raw_query);
    let key = if bypass {
        None
    } else {
        let params = cache_relevant_params(raw_query);
        let alias = class.user_scoped().then_some(&identity.alias);
        Some(fingerprint(
            class.as_str(),
            "GET",
            path,
            &params,
            alias,
            &identity.instance,
        ))
    };

    if let Some(key) = &key {
        if let Some(cached) = state.cache().get(key).await {
            return Ok((
                UpstreamResponse {
                    status: cached.status,
                    content_type: cached.content_type,
                    body: cached.body,
                    link: cached.link,
                    retry_after: None,
                },
                true,
            ));
        }
    }

    let path_and_query = match raw_query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    };

    let upstream = state
        .upstream()
        .get_json(&identity.instance, &path_and_query, identity.token.as_deref())
        .await?;

    if upstream.status >= 500 {
        return Err(Error::Upstream {
            status: upstream.status,
            message: "upstream failure".to_string(),
        });
    }

    if let Some(key) = &key {
        if upstream.status == 200 {
            state
                .cache()
                .put(
                    key,
                    class.cache_class(),
                    CachedResponse {
                        status: upstream.status,
                        content_type: upstream.content_type.clone(),
                        body: upstream.body.clone(),
                        link: upstream.link.clone(),
                    },
                )
                .await;
        }
    }

    Ok((upstream, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_the_dispatch_table() {
        let cases = [
            ("/health", EndpointClass::Health),
            ("/api/v1/timelines/home", EndpointClass::HomeTimeline),
            ("/api/v1/timelines/public", EndpointClass::PublicTimeline),
            ("/api/v1/timelines/recommended", EndpointClass::RecommendedTimeline),
            ("/api/v1/recommendations", EndpointClass::Recommendations),
            ("/api/v1/interactions", EndpointClass::Interactions),
            ("/api/v1/interactions/counts/batch", EndpointClass::InteractionCounts),
            ("/api/v1/accounts/123", EndpointClass::Profile),
            ("/api/v1/statuses/456", EndpointClass::Status),
            ("/api/v1/instance", EndpointClass::Instance),
            ("/api/v1/admin/reports", EndpointClass::Admin),
            ("/api/v1/notifications", EndpointClass::Other),
        ];
        for (path, expected) in cases {
            assert_eq!(EndpointClass::classify(path), expected, "path {path}");
        }
    }

    #[test]
    fn interaction_and_admin_endpoints_are_never_cacheable() {
        assert!(!EndpointClass::Interactions.cacheable());
        assert!(!EndpointClass::InteractionCounts.cacheable());
        assert!(!EndpointClass::Admin.cacheable());
        assert!(EndpointClass::Profile.cacheable());
        assert!(EndpointClass::HomeTimeline.cacheable());
    }

    #[test]
    fn skip_cache_flag_parsing() {
        assert!(skip_cache(Some("limit=20&skip_cache=1")));
        assert!(skip_cache(Some("skip_cache=true")));
        assert!(!skip_cache(Some("skip_cache=0")));
        assert!(!skip_cache(Some("limit=20")));
        assert!(!skip_cache(None));
    }

    #[test]
    fn cache_params_drop_skip_cache_only() {
        let params = cache_relevant_params(Some("limit=20&skip_cache=1&max_id=5"));
        assert_eq!(
            params,
            vec![
                ("limit".to_string(), "20".to_string()),
                ("max_id".to_string(), "5".to_string()),
            ]
        );
    }

    #[test]
    fn auth_policy_per_class() {
        assert!(EndpointClass::Interactions.auth_required());
        assert!(!EndpointClass::HomeTimeline.auth_required());
        assert!(EndpointClass::HomeTimeline.cold_start_substitutable());
        assert!(!EndpointClass::PublicTimeline.cold_start_substitutable());
    }
}
