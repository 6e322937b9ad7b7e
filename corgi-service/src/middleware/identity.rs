//! Identity resolution middleware
//!
//! Resolves the request identity once, attaches it as a request extension,
//! and advertises the tier used via `X-Corgi-Auth-Tier` on the response.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use http::{header::AUTHORIZATION, HeaderValue};

use crate::identity;
use crate::state::AppState;

/// Header advertising which resolution tier produced the identity
pub const AUTH_TIER_HEADER: &str = "x-corgi-auth-tier";

/// Resolve the caller's identity and attach it to the request
pub async fn resolve_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let query = request.uri().query().map(str::to_string);
    let query_user = parse_query_identity(query.as_deref());

    let resolved = identity::resolve(
        state.config(),
        state.store().as_ref(),
        bearer.as_deref(),
        query_user
            .as_ref()
            .map(|(user, instance)| (user.as_str(), instance.as_str())),
    )
    .await
    .unwrap_or_else(|_| {
        identity::ResolvedIdentity::anonymous(&state.config().upstream.default_instance)
    });

    let tier = resolved.tier;
    request.extensions_mut().insert(resolved);

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(AUTH_TIER_HEADER, HeaderValue::from_static(tier.as_str()));
    response
}

fn parse_query_identity(raw: Option<&str>) -> Option<(String, String)> {
    let raw = raw?;
    let mut user_id = None;
    let mut instance = None;
    for pair in raw.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            match k {
                "user_id" => user_id = Some(v.to_string()),
                "instance" => instance = Some(v.to_string()),
                _ => {}
            }
        }
    }
    Some((user_id?, instance?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_identity_needs_both_parameters() {
        assert_eq!(parse_query_identity(None), None);
        assert_eq!(parse_query_identity(Some("user_id=1")), None);
        assert_eq!(parse_query_identity(Some("instance=m.s")), None);
        assert_eq!(
            parse_query_identity(Some("user_id=1&instance=m.s&limit=5")),
            Some(("1".to_string(), "m.s".to_string()))
        );
    }
}
