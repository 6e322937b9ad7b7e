//! Liveness and readiness probes

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service name
    pub service: String,
    /// Version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Individual dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    /// Dependency is healthy
    pub healthy: bool,
    /// Optional message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Readiness check response with dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Overall readiness status
    pub ready: bool,
    /// Service name
    pub service: String,
    /// Dependency statuses
    pub dependencies: HashMap<String, DependencyStatus>,
    /// Jobs that exhausted their retry budget
    pub dead_letters: usize,
}

/// Liveness probe: 200 whenever the process is serving
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        service: state.config().service.name.clone(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    (StatusCode::OK, Json(response))
}

/// Readiness probe: 200 when the store answers, 503 otherwise. The cache
/// tier is advisory (the service degrades without it) and never fails
/// readiness.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let mut dependencies = HashMap::new();

    let store_healthy = match state.store().ping().await {
        Ok(()) => {
            dependencies.insert(
                "store".to_string(),
                DependencyStatus {
                    healthy: true,
                    message: None,
                },
            );
            true
        }
        Err(e) => {
            dependencies.insert(
                "store".to_string(),
                DependencyStatus {
                    healthy: false,
                    message: Some(e.to_string()),
                },
            );
            false
        }
    };

    dependencies.insert(
        "cache".to_string(),
        DependencyStatus {
            healthy: true,
            message: Some(if state.cache().has_shared_tier() {
                "in-process + redis".to_string()
            } else {
                "in-process only".to_string()
            }),
        },
    );

    let response = ReadinessResponse {
        ready: store_healthy,
        service: state.config().service.name.clone(),
        dependencies,
        dead_letters: state.jobs().dead_letter_count(),
    };

    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
