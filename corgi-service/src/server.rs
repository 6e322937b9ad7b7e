//! HTTP server: router assembly, middleware stack, graceful shutdown

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::config::Config;
use crate::error::Result;
use crate::handlers;
use crate::middleware::{enforce_rate_limit, processing_time, resolve_identity};
use crate::proxy;
use crate::state::AppState;

/// Request body bound for proxied writes
const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

/// Build the full router: mounted endpoints first, augmentation-eligible
/// routes next, then the pass-through proxy as the fallback.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::readiness))
        .route("/api/v1/timelines/home", get(handlers::timelines::home))
        .route("/api/v1/timelines/public", get(handlers::timelines::public))
        .route(
            "/api/v1/timelines/recommended",
            get(handlers::timelines::recommended),
        )
        .route(
            "/api/v1/recommendations",
            get(handlers::recommendations::list),
        )
        .route("/api/v1/interactions", post(handlers::interactions::submit))
        .route(
            "/api/v1/interactions/counts/batch",
            get(handlers::interactions::batch_counts),
        )
        .fallback(proxy::passthrough)
        // Innermost to outermost: the limiter needs the resolved identity,
        // and timing wraps everything.
        .layer(from_fn_with_state(state.clone(), enforce_rate_limit))
        .layer(from_fn_with_state(state.clone(), resolve_identity))
        .layer(from_fn(processing_time))
        .with_state(state)
}

/// Server instance
pub struct Server {
    config: Arc<Config>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Run the server. The shutdown token fires when a termination signal
    /// arrives so background work can drain while the listener closes.
    pub async fn serve(self, app: Router, shutdown: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.service.port));

        tracing::info!("Starting {} on {}", self.config.service.name, addr);

        let app = app
            .layer(CorsLayer::permissive())
            .layer(CompressionLayer::new())
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.service.timeout_secs,
            )))
            .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_response(DefaultOnResponse::new()),
            )
            .layer(CatchPanicLayer::new());

        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("Server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown))
            .await?;

        tracing::info!("Server shutdown complete");

        Ok(())
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    tracing::info!("Shutdown signal received; draining");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::memory_state;
    use axum::body::Body;
    use chrono::Utc;
    use http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::models::{
        DiscoveryMeta, DiscoverySource, EngagementCounts, Post, PostKey,
    };

    fn post(id: &str, author: &str, language: &str, favourites: u64) -> Post {
        let now = Utc::now();
        Post {
            key: PostKey::new("mastodon.social", id),
            author: author.to_string(),
            content: format!("<p>{id}</p>"),
            created_at: now - chrono::Duration::hours(1),
            language: Some(language.to_string()),
            language_confidence: Some(0.9),
            tags: vec![],
            engagement: EngagementCounts { favourites, reblogs: 0, replies: 0 },
            media: vec![],
            discovery: DiscoveryMeta {
                source: DiscoverySource::Timeline,
                discovered_at: now,
                reason: "public".to_string(),
            },
        }
    }

    async fn seeded_state(config: Config) -> AppState {
        let (state, _runner) = memory_state(config).await;
        for (id, author, lang, favs) in [
            ("es1", "a1@mastodon.social", "es", 9),
            ("es2", "a2@mastodon.social", "es", 8),
            ("es3", "a3@mastodon.social", "es", 7),
            ("en1", "b1@mastodon.social", "en", 9),
            ("en2", "b2@mastodon.social", "en", 8),
            ("en3", "b3@mastodon.social", "en", 7),
            ("en4", "b4@mastodon.social", "en", 6),
            ("en5", "b5@mastodon.social", "en", 6),
            ("en6", "b6@mastodon.social", "en", 6),
            ("en7", "b7@mastodon.social", "en", 6),
        ] {
            state
                .store()
                .upsert_post(&post(id, author, lang, favs))
                .await
                .unwrap();
        }
        state
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, http::HeaderMap, Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn dev_config() -> Config {
        let mut config = Config::default();
        config.identity.allow_query_fallback = true;
        config
    }

    #[tokio::test]
    async fn anonymous_rate_limit_hits_at_the_31st_call() {
        let state = seeded_state(Config::default()).await;
        let app = router(state);

        for _ in 0..30 {
            let (status, _, _) = get(&app, "/api/v1/timelines/recommended?limit=20").await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, headers, body) =
            get(&app, "/api/v1/timelines/recommended?limit=20").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(headers.contains_key(http::header::RETRY_AFTER));
        assert_eq!(body["code"], "rate_limited");
        assert!(body["retry_after_secs"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn language_filter_serves_only_spanish_cold_start() {
        let state = seeded_state(Config::default()).await;
        let app = router(state);

        let (status, headers, body) =
            get(&app, "/api/v1/timelines/recommended?languages=es&limit=20").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-corgi-source").unwrap(), "cold_start");

        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i["language"] == "es"));
        // Trending order: highest engagement first.
        assert_eq!(items[0]["id"], "mastodon.social:es1");
    }

    #[tokio::test]
    async fn limit_bounds_per_the_query_contract() {
        let state = seeded_state(Config::default()).await;
        let app = router(state);

        let (status, _, body) = get(&app, "/api/v1/timelines/recommended?limit=0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 0);

        let (status, _, body) = get(&app, "/api/v1/timelines/recommended?limit=101").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_error");
    }

    #[tokio::test]
    async fn cache_keys_isolate_aliases_and_skip_cache_bypasses() {
        let state = seeded_state(dev_config()).await;
        let app = router(state);

        let alice = "/api/v1/timelines/recommended?limit=10&user_id=1&instance=mastodon.social";
        let bob = "/api/v1/timelines/recommended?limit=10&user_id=2&instance=mastodon.social";

        let (_, headers, _) = get(&app, alice).await;
        assert_eq!(headers.get("x-corgi-source").unwrap(), "recommended");
        assert_eq!(headers.get("x-corgi-auth-tier").unwrap(), "query");

        // Same alias again: served from cache.
        let (_, headers, _) = get(&app, alice).await;
        assert_eq!(headers.get("x-corgi-source").unwrap(), "cache");

        // A different alias must not see Alice's cached page.
        let (_, headers, _) = get(&app, bob).await;
        assert_eq!(headers.get("x-corgi-source").unwrap(), "recommended");

        // skip_cache bypasses read and write.
        let skip = format!("{alice}&skip_cache=1");
        let (_, headers, _) = get(&app, &skip).await;
        assert_eq!(headers.get("x-corgi-source").unwrap(), "recommended");
        let (_, headers, _) = get(&app, &skip).await;
        assert_eq!(headers.get("x-corgi-source").unwrap(), "recommended");
    }

    #[tokio::test]
    async fn interaction_favorite_is_idempotent_at_the_effective_layer() {
        let state = seeded_state(dev_config()).await;
        let app = router(state);

        let submit = || async {
            let request = Request::builder()
                .method("POST")
                .uri("/api/v1/interactions?user_id=7&instance=mastodon.social")
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"post_id":"mastodon.social:es1","action":"favorite"}"#,
                ))
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let body: Value = serde_json::from_slice(&bytes).unwrap();
            (status, body)
        };

        let (status, first) = submit().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["favourited"], true);

        let (status, second) = submit().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["favourited"], true);
        // No double increment: the counter a client sees is unchanged.
        assert_eq!(first["favourites"], second["favourites"]);
    }

    #[tokio::test]
    async fn interactions_require_identity() {
        let state = seeded_state(Config::default()).await;
        let app = router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/interactions")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"post_id":"mastodon.social:es1","action":"favorite"}"#,
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upstream_outage_degrades_home_to_cold_start() {
        let mut config = Config::default();
        // An unreachable upstream stands in for a 5xx outage.
        config.upstream.default_instance = "127.0.0.1".to_string();
        config.upstream.timeout_secs = 2;
        let state = seeded_state(config).await;
        let app = router(state);

        let (status, headers, body) = get(&app, "/api/v1/timelines/home").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-corgi-source").unwrap(), "cold_start");

        let items = body.as_array().unwrap();
        assert!(!items.is_empty());
        assert!(items.iter().all(|i| i["is_recommendation"] == true));
    }

    #[tokio::test]
    async fn batch_counts_report_success_rate() {
        let state = seeded_state(Config::default()).await;
        let app = router(state);

        let (status, headers, body) = get(
            &app,
            "/api/v1/interactions/counts/batch?ids=mastodon.social:es1,mastodon.social:missing",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-corgi-success-rate").unwrap(), "0.50");
        assert_eq!(body["counts"]["mastodon.social:es1"]["favourites"], 9);
        assert!(body["counts"]["mastodon.social:missing"].is_null());
    }

    #[tokio::test]
    async fn health_is_always_live_and_ready_reports_dependencies() {
        let state = seeded_state(Config::default()).await;
        let app = router(state);

        let (status, _, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, _, body) = get(&app, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert_eq!(body["dependencies"]["store"]["healthy"], true);
    }

    #[tokio::test]
    async fn recommendations_returns_records_without_bodies() {
        let state = seeded_state(Config::default()).await;
        let app = router(state);

        let (status, headers, body) = get(&app, "/api/v1/recommendations?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-corgi-source").unwrap(), "cold_start");

        let records = body.as_array().unwrap();
        assert!(!records.is_empty());
        assert!(records.len() <= 5);
        for record in records {
            assert!(record["score"].as_f64().unwrap() <= 1.0);
            assert!(record.get("content").is_none());
            assert!(record.get("post_key").is_some());
        }
    }
}

