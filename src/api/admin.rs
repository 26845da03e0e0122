//! Admin API — operator-facing read-only introspection endpoints.
//!
//! Separated onto its own port so it can be network-restricted independently
//! of the client API (e.g. reachable only from the internal network, never
//! exposed publicly). Every route here is read-only: nothing here can change
//! routing, budgets, or circuit state — that is out of scope for the core.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::circuit::CircuitStatus;
use crate::state::AppState;

/// Build the admin-facing axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/usage", get(usage))
        .route("/admin/decisions", get(decisions))
        .route("/admin/config", get(config))
        .route("/admin/circuits", get(circuits))
        .with_state(state)
}

/// GET /admin/health — liveness plus whether the gateway is accepting requests.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "ready": state.gateway.is_ready(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Deserialize)]
pub struct UsageQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// GET /admin/usage?limit=N — aggregate stats plus the N most recent usage records.
pub async fn usage(State(state): State<Arc<AppState>>, Query(q): Query<UsageQuery>) -> impl IntoResponse {
    let stats = state.usage_log.stats().await;
    let recent = state.usage_log.recent(q.limit).await;
    Json(json!({ "stats": stats, "recent": recent }))
}

/// GET /admin/decisions?limit=N — recent routing decisions, including which
/// candidates were rejected and why. Audit aid, not part of the hot path.
pub async fn decisions(State(state): State<Arc<AppState>>, Query(q): Query<UsageQuery>) -> impl IntoResponse {
    let recent = state.decision_log.recent(q.limit).await;
    Json(json!({ "recent": recent }))
}

fn status_label(status: CircuitStatus) -> &'static str {
    match status {
        CircuitStatus::Closed => "closed",
        CircuitStatus::Open => "open",
        CircuitStatus::HalfOpen => "half_open",
    }
}

/// GET /admin/circuits — per-model circuit breaker status.
pub async fn circuits(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.config().await;
    let statuses: Vec<_> = config
        .models
        .keys()
        .map(|model_id| json!({ "model_id": model_id, "status": status_label(state.circuit.status(model_id)) }))
        .collect();
    Json(json!({ "circuits": statuses }))
}

/// GET /admin/config — current config with secrets redacted (env var name shown, never the value).
pub async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = state.config.config().await;

    let models: Vec<_> = cfg
        .models
        .values()
        .map(|m| {
            json!({
                "model_id": m.model_id,
                "provider": m.provider,
                "model_name": m.model_name,
                "api_key_env": m.api_key_env,
                "priority": m.priority,
                "cost_per_token": m.cost_per_token,
                "max_tokens": m.max_tokens,
                "is_active": m.is_active,
            })
        })
        .collect();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "usage_log_capacity": cfg.gateway.usage_log_capacity,
            "request_timeout_ms": cfg.gateway.request_timeout_ms,
            "per_model_concurrency": cfg.gateway.per_model_concurrency,
            "cache_ttl_secs": cfg.gateway.cache_ttl_secs,
            "cache_max_entries": cfg.gateway.cache_max_entries,
            "circuit_failure_threshold": cfg.gateway.circuit_failure_threshold,
            "rate_limit_per_hour": cfg.gateway.rate_limit_per_hour,
            "budget_enforcement": cfg.gateway.budget_enforcement,
            "default_provider": cfg.gateway.default_provider,
        },
        "models": models,
        "routing_rules": cfg.routing_rules,
        "tier_limits": cfg.tier_limits,
    }))
}
