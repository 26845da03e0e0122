//! Client-facing API (port from `[gateway].client_port`) — the endpoint
//! application code talks to.
//!
//! This is intentionally a thin layer: all pipeline logic lives in
//! [`crate::gateway::Gateway`]. The handler only translates an HTTP JSON body
//! into a [`Request`] and the [`Response`]/[`GatewayError`] result back into
//! JSON.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    response::IntoResponse,
    routing::post,
    Extension, Json, Router,
};
use serde::Deserialize;

use crate::error::GatewayError;
use crate::models::{Request, RequestPriority, UserTier};
use crate::state::{AppState, ClientPrincipal};

/// Build the client-facing axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", axum::routing::get(crate::api::health::healthz))
        .route("/v1/completions", post(completions))
        .with_state(state)
}

/// Wire shape of a `POST /v1/completions` body. Deliberately permissive:
/// every field but `prompt` has a sane default, and `user_id` is optional
/// when the client port's bearer-key gate already resolved a principal.
#[derive(Debug, Deserialize)]
pub struct CompletionRequestBody {
    pub prompt: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub user_tier: Option<UserTier>,
    #[serde(default)]
    pub priority: RequestPriority,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_task_type() -> String {
    "general".to_string()
}

impl CompletionRequestBody {
    fn into_request(self, principal: Option<&ClientPrincipal>) -> Result<Request, GatewayError> {
        let user_id = self
            .user_id
            .or_else(|| principal.map(|p| p.user_id.clone()))
            .ok_or_else(|| GatewayError::InvalidRequest("user_id is required".into()))?;
        let user_tier = self.user_tier.or_else(|| principal.map(|p| p.tier)).unwrap_or(UserTier::Free);

        Ok(Request {
            prompt: self.prompt,
            user_id,
            session_id: self.session_id,
            task_type: self.task_type,
            user_tier,
            priority: self.priority,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: self.stream,
            metadata: self.metadata,
        })
    }
}

/// `POST /v1/completions` — runs the body through [`crate::gateway::Gateway::process`].
pub async fn completions(
    State(state): State<Arc<AppState>>,
    principal: Option<Extension<ClientPrincipal>>,
    Json(body): Json<CompletionRequestBody>,
) -> impl IntoResponse {
    let principal = principal.map(|Extension(p)| p);
    match body.into_request(principal.as_ref()) {
        Ok(request) => match state.gateway.process(request).await {
            Ok(response) => Json(response).into_response(),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}
