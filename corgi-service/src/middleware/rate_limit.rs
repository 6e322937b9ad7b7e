//! Per-alias, per-endpoint-class sliding-window rate limiting
//!
//! The window is a pruned timestamp log per `(alias, endpoint class)`, so
//! ceilings are exact rather than fixed-window approximations. Anonymous
//! traffic gets a substantially lower ceiling than authenticated traffic.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::error::Error;
use crate::identity::{ResolvedIdentity, UserAlias};
use crate::proxy::EndpointClass;
use crate::state::AppState;

/// Sliding-window limiter keyed by alias and endpoint class
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter with the configured ceilings
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Record a hit. `Ok` admits the request; `Err` carries the suggested
    /// retry delay in seconds.
    pub fn check(&self, alias: &UserAlias, class: EndpointClass) -> Result<(), u64> {
        self.check_at(alias, class, Instant::now())
    }

    fn check_at(
        &self,
        alias: &UserAlias,
        class: EndpointClass,
        now: Instant,
    ) -> Result<(), u64> {
        let limit = if alias.is_anonymous() {
            self.config.anonymous_rpm
        } else {
            self.config.authenticated_rpm
        } as usize;

        let window = Duration::from_secs(self.config.window_secs);
        let key = format!("{}:{}", alias.as_str(), class.as_str());

        let mut hits = self.windows.entry(key).or_default();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= limit {
            let retry_after = match hits.front() {
                Some(oldest) => window
                    .checked_sub(now.duration_since(*oldest))
                    .unwrap_or(Duration::ZERO),
                None => window,
            };
            return Err(retry_after.as_secs().max(1));
        }

        hits.push_back(now);
        Ok(())
    }
}

/// Middleware enforcing the limiter. Must run after identity resolution.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let class = EndpointClass::classify(request.uri().path());
    if class == EndpointClass::Health {
        return next.run(request).await;
    }

    let alias = request
        .extensions()
        .get::<ResolvedIdentity>()
        .map(|id| id.alias.clone())
        .unwrap_or_else(UserAlias::anonymous);

    match state.limiter().check(&alias, class) {
        Ok(()) => next.run(request).await,
        Err(retry_after_secs) => {
            tracing::warn!(
                alias = %alias,
                endpoint_class = class.as_str(),
                retry_after_secs,
                "rate limit exceeded"
            );
            Error::RateLimited { retry_after_secs }.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(anonymous_rpm: u32, authenticated_rpm: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            anonymous_rpm,
            authenticated_rpm,
            window_secs: 60,
        })
    }

    #[test]
    fn anonymous_ceiling_is_enforced_with_retry_hint() {
        let limiter = limiter(30, 300);
        let anon = UserAlias::anonymous();
        let now = Instant::now();

        for _ in 0..30 {
            assert!(limiter
                .check_at(&anon, EndpointClass::RecommendedTimeline, now)
                .is_ok());
        }
        // The 31st call within the window is rejected.
        let retry = limiter
            .check_at(&anon, EndpointClass::RecommendedTimeline, now)
            .unwrap_err();
        assert!(retry >= 1 && retry <= 60);
    }

    #[test]
    fn authenticated_ceiling_is_higher() {
        let limiter = limiter(30, 300);
        let alias = UserAlias::from_raw("someone");
        let now = Instant::now();
        for _ in 0..300 {
            assert!(limiter
                .check_at(&alias, EndpointClass::HomeTimeline, now)
                .is_ok());
        }
        assert!(limiter
            .check_at(&alias, EndpointClass::HomeTimeline, now)
            .is_err());
    }

    #[test]
    fn windows_are_separate_per_endpoint_class() {
        let limiter = limiter(2, 300);
        let anon = UserAlias::anonymous();
        let now = Instant::now();

        assert!(limiter.check_at(&anon, EndpointClass::HomeTimeline, now).is_ok());
        assert!(limiter.check_at(&anon, EndpointClass::HomeTimeline, now).is_ok());
        assert!(limiter.check_at(&anon, EndpointClass::HomeTimeline, now).is_err());

        // A different endpoint class has its own window.
        assert!(limiter
            .check_at(&anon, EndpointClass::RecommendedTimeline, now)
            .is_ok());
    }

    #[test]
    fn window_slides() {
        let limiter = limiter(2, 300);
        let anon = UserAlias::anonymous();
        let start = Instant::now();

        assert!(limiter.check_at(&anon, EndpointClass::Other, start).is_ok());
        assert!(limiter.check_at(&anon, EndpointClass::Other, start).is_ok());
        assert!(limiter.check_at(&anon, EndpointClass::Other, start).is_err());

        let later = start + Duration::from_secs(61);
        assert!(limiter.check_at(&anon, EndpointClass::Other, later).is_ok());
    }
}
