//! Bearer-token gate on the client port.
//!
//! This is the "bearer-token gate... assumed to yield a user principal
//! upstream of the core" — everything past this middleware treats `user_id`
//! as already authenticated. When `[[clients]]` is configured, a request must
//! carry `Authorization: Bearer <key>` matching one of the configured keys;
//! the resolved [`ClientPrincipal`] is injected as a request extension so
//! `completions` can default `user_id`/`user_tier` from it without the
//! caller repeating them in the body.
//!
//! When no `[[clients]]` entries are configured the middleware is a no-op —
//! the client port accepts unauthenticated requests and `user_id` must be
//! supplied in the request body.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

/// Axum middleware: enforces per-client Bearer token auth when `[[clients]]`
/// is configured, and injects a [`crate::state::ClientPrincipal`] extension
/// for the handler.
pub async fn client_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if state.client_map.is_empty() {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided.and_then(|key| state.client_map.get(key)) {
        Some(principal) => {
            req.extensions_mut().insert(principal.clone());
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"gateway\"")],
            "Valid client API key required.",
        )
            .into_response(),
    }
}
