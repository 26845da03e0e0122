//! OpenAI chat completions adapter.
//!
//! Talks to OpenAI's `/v1/chat/completions` endpoint directly. Grounded on
//! the teacher's OpenAI-compatible passthrough adapter, adapted to build the
//! request from the neutral [`EnrichedRequest`] shape rather than forwarding
//! an opaque JSON body, since this gateway no longer proxies raw client JSON.

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{estimate_tokens, AdapterOutcome};
use crate::config::ModelConfiguration;
use crate::error::AdapterError;
use crate::models::EnrichedRequest;

pub struct OpenAIAdapter {
    client: Client,
    base_url: String,
}

impl OpenAIAdapter {
    pub fn new(api_key: String, timeout_ms: u64) -> Self {
        Self::with_base_url("https://api.openai.com".to_string(), api_key, timeout_ms)
    }

    /// Constructs against an arbitrary base URL — used by tests against a
    /// mock server.
    pub fn with_base_url(base_url: String, api_key: String, timeout_ms: u64) -> Self {
        let mut headers = header::HeaderMap::new();
        let value = format!("Bearer {api_key}");
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&value)
                .expect("API key contains invalid Authorization header characters"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }

    pub async fn generate(
        &self,
        request: &EnrichedRequest,
        model: &ModelConfiguration,
    ) -> Result<AdapterOutcome, AdapterError> {
        let body = json!({
            "model": model.model_name,
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_tokens.unwrap_or(model.max_tokens),
            "temperature": request.temperature.unwrap_or(model.temperature),
        });

        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AdapterError::Transient(format!("reading response body: {e}")))?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::RateLimited(text));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AdapterError::Auth(text));
        }
        if status.is_client_error() {
            return Err(AdapterError::ClientInvalid(format!("HTTP {status}: {text}")));
        }
        if status.is_server_error() {
            return Err(AdapterError::Transient(format!("HTTP {status}: {text}")));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| AdapterError::Fatal(format!("parsing OpenAI response: {e}")))?;

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AdapterError::Fatal("no content in OpenAI response".into()))?
            .to_string();

        let tokens_used = parsed["usage"]["total_tokens"]
            .as_u64()
            .map(|t| t as u32)
            .unwrap_or_else(|| estimate_tokens(&request.prompt, &content));

        Ok(AdapterOutcome { content, tokens_used })
    }

    pub async fn health_check(&self) -> Result<(), AdapterError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdapterError::Transient(format!("health check returned HTTP {}", response.status())))
        }
    }
}
