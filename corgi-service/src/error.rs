//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Structured Store Errors
// ============================================================================

/// Store operation being performed when the error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// Establishing a store connection
    Connect,
    /// Executing a read query
    Query,
    /// Inserting records
    Insert,
    /// Updating records
    Update,
    /// Deleting records
    Delete,
    /// Transaction operations (begin, commit, rollback)
    Transaction,
    /// Bootstrapping the schema
    Schema,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Query => write!(f, "query"),
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Transaction => write!(f, "transaction"),
            Self::Schema => write!(f, "schema"),
        }
    }
}

/// Category of store error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// Failed to establish connection
    ConnectionFailed,
    /// Record not found
    NotFound,
    /// Constraint violation (unique, foreign key, check)
    ConstraintViolation,
    /// Query execution failed
    QueryFailed,
    /// Transaction failed (begin, commit, or rollback)
    TransactionFailed,
    /// Type conversion error
    TypeConversion,
    /// Operation timed out
    Timeout,
    /// Row or table lock contention
    Busy,
    /// Connection pool exhausted
    PoolExhausted,
    /// Other/unknown error
    Other,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::NotFound => write!(f, "not_found"),
            Self::ConstraintViolation => write!(f, "constraint_violation"),
            Self::QueryFailed => write!(f, "query_failed"),
            Self::TransactionFailed => write!(f, "transaction_failed"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Timeout => write!(f, "timeout"),
            Self::Busy => write!(f, "busy"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured store error with operation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// The operation being performed when the error occurred
    pub operation: StoreOperation,
    /// The category of error
    pub kind: StoreErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Additional context (e.g., table name, key)
    pub context: Option<String>,
}

impl StoreError {
    /// Create a new store error
    pub fn new(
        operation: StoreOperation,
        kind: StoreErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Create a new store error with context
    pub fn with_context(
        operation: StoreOperation,
        kind: StoreErrorKind,
        message: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            context: Some(context.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            StoreOperation::Connect,
            StoreErrorKind::ConnectionFailed,
            message,
        )
    }

    /// Create a query failed error
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::new(StoreOperation::Query, StoreErrorKind::QueryFailed, message)
    }

    /// Whether the background runner may retry the failed operation.
    ///
    /// Transient infrastructure failures (lock contention, timeouts,
    /// exhausted pools, dropped connections) are retriable; semantic
    /// failures (constraint violations, type mismatches) are not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::ConnectionFailed
                | StoreErrorKind::Timeout
                | StoreErrorKind::Busy
                | StoreErrorKind::PoolExhausted
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(
                f,
                "store {} failed ({}): {} [{}]",
                self.operation, self.kind, self.message, ctx
            ),
            None => write!(
                f,
                "store {} failed ({}): {}",
                self.operation, self.kind, self.message
            ),
        }
    }
}

// ============================================================================
// Service Error Taxonomy
// ============================================================================

/// A single offending field in a validation failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    /// Field name as it appeared in the request
    pub field: String,
    /// What was wrong with it
    pub message: String,
}

impl FieldError {
    /// Create a new field error
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result type alias using the service error
pub type Result<T> = std::result::Result<T, Error>;

/// Service error taxonomy
///
/// Every variant maps to a stable HTTP status and machine-readable code.
/// Graceful-degradation endpoints substitute cached or cold-start content
/// for `Upstream`/`Timeout`/`RankingUnavailable`; never for `Validation`
/// or `AuthRequired`.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Bad inputs; details list offending fields
    #[error("Validation error: {message}")]
    Validation {
        /// Summary of the failure
        message: String,
        /// Offending fields, possibly empty
        fields: Vec<FieldError>,
    },

    /// Missing or invalid token on a strict endpoint
    #[error("Authentication required")]
    AuthRequired,

    /// Rate ceiling breached for the requesting alias
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Suggested delay before retrying, in seconds
        retry_after_secs: u64,
    },

    /// Unknown post or user
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream non-retryable failure; preserves upstream status
    #[error("Upstream error ({status}): {message}")]
    Upstream {
        /// Status the upstream instance returned (0 when unreachable)
        status: u16,
        /// Short description, never raw upstream internals
        message: String,
    },

    /// Deadline exceeded talking to upstream or a dependency
    #[error("Deadline exceeded")]
    Timeout,

    /// Persistence failure
    #[error("{0}")]
    Store(StoreError),

    /// Ranking pipeline failure at or before persistence
    #[error("Ranking unavailable: {0}")]
    RankingUnavailable(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Residual bucket; logged at high severity
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for a single-field validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = FieldError::new(field, message);
        Self::Validation {
            message: format!("invalid field: {}", field.field),
            fields: vec![field],
        }
    }

    /// Machine-readable error code, stable across releases
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "internal_error",
            Error::Validation { .. } => "validation_error",
            Error::AuthRequired => "auth_required",
            Error::RateLimited { .. } => "rate_limited",
            Error::NotFound(_) => "not_found",
            Error::Upstream { .. } => "upstream_error",
            Error::Timeout => "timeout",
            Error::Store(_) => "store_error",
            Error::RankingUnavailable(_) => "ranking_unavailable",
            Error::Io(_) => "internal_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the variant maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::AuthRequired => StatusCode::UNAUTHORIZED,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::RankingUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) | Error::Store(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(Box::new(e))
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Machine-readable error code
    pub code: String,

    /// HTTP status code
    pub status: u16,

    /// Suggested retry delay in seconds (rate limiting only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    /// Offending fields (validation only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldError>>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            status: status.as_u16(),
            retry_after_secs: None,
            fields: None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let body = match &self {
            Error::Validation { message, fields } => {
                let mut r = ErrorResponse::new(status, code, message.clone());
                if !fields.is_empty() {
                    r.fields = Some(fields.clone());
                }
                r
            }

            Error::AuthRequired => {
                ErrorResponse::new(status, code, "authentication required")
            }

            Error::RateLimited { retry_after_secs } => {
                let mut r = ErrorResponse::new(status, code, "rate limit exceeded");
                r.retry_after_secs = Some(*retry_after_secs);
                r
            }

            // Identical shape for unknown and unauthorized resources so
            // callers cannot enumerate users or posts.
            Error::NotFound(_) => ErrorResponse::new(status, code, "resource not found"),

            Error::Upstream { status: upstream, .. } => {
                tracing::warn!(upstream_status = upstream, "upstream request failed");
                ErrorResponse::new(status, code, "upstream request failed")
            }

            Error::Timeout => ErrorResponse::new(status, code, "deadline exceeded"),

            Error::Store(e) => {
                tracing::error!(
                    operation = %e.operation,
                    kind = %e.kind,
                    context = ?e.context,
                    retriable = e.is_retriable(),
                    "Store error: {}", e.message
                );
                ErrorResponse::new(status, code, "persistence failure")
            }

            Error::RankingUnavailable(msg) => {
                tracing::error!("Ranking pipeline failure: {}", msg);
                ErrorResponse::new(status, code, "rankings temporarily unavailable")
            }

            Error::Config(e) => {
                tracing::error!("Configuration error: {}", e);
                ErrorResponse::new(status, code, "internal error")
            }

            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                ErrorResponse::new(status, code, "internal error")
            }

            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ErrorResponse::new(status, code, "internal error")
            }
        };

        let mut response = (status, Json(body)).into_response();

        if let Error::RateLimited { retry_after_secs } = &self {
            if let Ok(v) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(http::header::RETRY_AFTER, v);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_stable_codes_and_statuses() {
        let cases: Vec<(Error, &str, StatusCode)> = vec![
            (
                Error::validation("limit", "out of range"),
                "validation_error",
                StatusCode::BAD_REQUEST,
            ),
            (Error::AuthRequired, "auth_required", StatusCode::UNAUTHORIZED),
            (
                Error::RateLimited { retry_after_secs: 12 },
                "rate_limited",
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::NotFound("post".into()),
                "not_found",
                StatusCode::NOT_FOUND,
            ),
            (
                Error::Upstream { status: 500, message: "boom".into() },
                "upstream_error",
                StatusCode::BAD_GATEWAY,
            ),
            (Error::Timeout, "timeout", StatusCode::GATEWAY_TIMEOUT),
            (
                Error::Store(StoreError::query_failed("oops")),
                "store_error",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                Error::RankingUnavailable("preaggregation".into()),
                "ranking_unavailable",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::Internal("bug".into()),
                "internal_error",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status(), status);
        }
    }

    #[test]
    fn retriability_classification() {
        let busy = StoreError::new(StoreOperation::Update, StoreErrorKind::Busy, "locked");
        assert!(busy.is_retriable());

        let constraint = StoreError::new(
            StoreOperation::Insert,
            StoreErrorKind::ConstraintViolation,
            "duplicate",
        );
        assert!(!constraint.is_retriable());

        let timeout = StoreError::new(StoreOperation::Query, StoreErrorKind::Timeout, "slow");
        assert!(timeout.is_retriable());
    }

    #[test]
    fn not_found_body_never_names_the_resource() {
        // User-enumeration guard: unknown user and unauthorized user produce
        // byte-identical bodies.
        let a = Error::NotFound("user alice".into());
        let b = Error::NotFound("user bob (not authorized)".into());
        let shape = |e: Error| match e {
            Error::NotFound(_) => "resource not found".to_string(),
            _ => unreachable!(),
        };
        assert_eq!(shape(a), shape(b));
    }
}
