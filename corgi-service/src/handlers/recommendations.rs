//! Raw ranking records, no post bodies

use axum::{
    extract::{Extension, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::Deserialize;

use crate::error::Result;
use crate::identity::ResolvedIdentity;
use crate::pagination::{parse_languages, validate_limit, validate_min_score};
use crate::proxy::SOURCE_HEADER;
use crate::ranking::RankingRequest;
use crate::state::AppState;

/// Query parameters for `/api/v1/recommendations`
#[derive(Debug, Default, Deserialize)]
pub struct RecommendationsQuery {
    /// Number of records, bounded to [0, 100]
    pub limit: Option<i64>,
    /// Minimum score, [0.0, 1.0]
    pub min_score: Option<f64>,
    /// Comma-separated language tags
    pub languages: Option<String>,
    /// Scoring model id
    pub model_id: Option<String>,
}

/// `GET /api/v1/recommendations`
pub async fn list(
    State(state): State<AppState>,
    Extension(identity): Extension<ResolvedIdentity>,
    Query(query): Query<RecommendationsQuery>,
) -> Response {
    match list_inner(&state, &identity, &query).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn list_inner(
    state: &AppState,
    identity: &ResolvedIdentity,
    query: &RecommendationsQuery,
) -> Result<Response> {
    let limit = validate_limit(query.limit)?;
    let min_score = validate_min_score(query.min_score)?;

    let request = RankingRequest {
        alias: identity.alias.clone(),
        limit,
        min_score,
        exclude: Vec::new(),
        languages: parse_languages(query.languages.as_deref()),
        model_id: query.model_id.clone(),
        diversity: false,
    };
    let records = if limit == 0 {
        Vec::new()
    } else {
        state.rankings().rankings_for(&request).await?
    };

    let source = if identity.alias.is_anonymous() {
        "cold_start"
    } else {
        "recommended"
    };

    let mut response = (StatusCode::OK, Json(records)).into_response();
    if let Ok(value) = source.parse() {
        response.headers_mut().insert(SOURCE_HEADER, value);
    }
    Ok(response)
}
