//! Error types for the gateway.
//!
//! Two layers, deliberately kept separate:
//!
//! - [`GatewayError`] is the typed, matchable result of [`crate::gateway::Gateway::process`].
//!   Callers (the HTTP layer, tests, other embedders) match on its variants to
//!   decide retry policy and status codes. It never carries a secret value.
//! - [`AppError`] wraps [`anyhow::Error`] for axum handlers that fail for reasons
//!   outside the gateway pipeline itself (bad JSON body, IO errors, etc.) and
//!   converts into an HTTP response automatically via [`IntoResponse`].
//!
//! # Example
//!
//! ```rust,ignore
//! async fn my_handler(
//!     State(state): State<Arc<AppState>>,
//! ) -> Result<Json<Value>, AppError> {
//!     let result = state.some_fallible_operation().await?;
//!     Ok(Json(result))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Outcome of a single request through the gateway pipeline.
///
/// Every variant is a stable, user-facing error kind. Messages attached to a
/// variant must never include resolved secret values — adapters and the
/// secret resolver are responsible for keeping those out of error text in the
/// first place.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("gateway is not ready")]
    NotReady,

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("budget exceeded: {limits_exceeded:?}")]
    BudgetExceeded { limits_exceeded: Vec<String> },

    #[error("no model available for this request")]
    NoModel,

    #[error("request timed out after {deadline_ms}ms")]
    Timeout { deadline_ms: u64 },

    #[error("upstream provider failure: {0}")]
    UpstreamFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable tag, independent of the display message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::NotReady => "NOT_READY",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::NoModel => "NO_MODEL",
            Self::Timeout { .. } => "TIMEOUT",
            Self::UpstreamFailure(_) => "UPSTREAM_FAILURE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status the client-facing surface maps this error to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BudgetExceeded { .. } => StatusCode::FORBIDDEN,
            Self::NoModel => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::warn!(kind = self.kind(), error = %self, "request failed");
        let mut body = json!({ "error": self.to_string(), "kind": self.kind() });
        if let Self::RateLimited { retry_after_secs } = &self {
            body["retry_after_secs"] = json!(retry_after_secs);
        }
        if let Self::BudgetExceeded { limits_exceeded } = &self {
            body["limits_exceeded"] = json!(limits_exceeded);
        }
        (self.status_code(), Json(body)).into_response()
    }
}

/// Errors produced by a provider adapter, before they are folded into a
/// [`GatewayError`] by the facade. Distinguished by retry/circuit semantics
/// rather than by provider.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdapterError {
    /// Network failure, connection reset, or 5xx from the provider. Counts
    /// against the circuit breaker and is eligible for failover.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Provider responded 429. Counts against the circuit breaker and is
    /// eligible for failover.
    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    /// Provider responded 4xx for a reason other than rate limiting (bad
    /// request shape, unknown model, etc). Never retried, never counted
    /// against the circuit.
    #[error("invalid request to upstream: {0}")]
    ClientInvalid(String),

    /// Provider responded 401/403, or credential resolution failed. Counts
    /// against the circuit breaker.
    #[error("upstream auth failure: {0}")]
    Auth(String),

    /// Anything else unexpected (malformed response schema, invariant
    /// violation). Counts against the circuit breaker.
    #[error("fatal adapter error: {0}")]
    Fatal(String),
}

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers that sit
/// outside the gateway pipeline proper (body parsing, admin introspection).
///
/// Any type that implements `Into<anyhow::Error>` (which includes `io::Error`,
/// `reqwest::Error`, and any `#[derive(thiserror::Error)]` type) can be
/// converted into an [`AppError`] via the blanket [`From`] implementation.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "handler error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`].
///
/// This is the idiomatic axum pattern — see
/// <https://docs.rs/axum/latest/axum/error_handling/index.html>.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
