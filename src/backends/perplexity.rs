//! Perplexity adapter.
//!
//! Perplexity's chat API is OpenAI-compatible, so — like the teacher's Ollama
//! adapter — this is a thin passthrough rather than a schema translator: same
//! request/response shape as OpenAI, just a different base URL, bearer auth,
//! and no `/v1/models` listing endpoint to health-check against.

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{estimate_tokens, AdapterOutcome};
use crate::config::ModelConfiguration;
use crate::error::AdapterError;
use crate::models::EnrichedRequest;

pub struct PerplexityAdapter {
    client: Client,
    base_url: String,
}

impl PerplexityAdapter {
    pub fn new(api_key: String, timeout_ms: u64) -> Self {
        Self::with_base_url("https://api.perplexity.ai".to_string(), api_key, timeout_ms)
    }

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

        let url = format!("{}/chat/completions", self.base_url);
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
            .map_err(|e| AdapterError::Fatal(format!("parsing Perplexity response: {e}")))?;

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AdapterError::Fatal("no content in Perplexity response".into()))?
            .to_string();

        let tokens_used = parsed["usage"]["total_tokens"]
            .as_u64()
            .map(|t| t as u32)
            .unwrap_or_else(|| estimate_tokens(&request.prompt, &content));

        Ok(AdapterOutcome { content, tokens_used })
    }

    /// Perplexity publishes no lightweight probe endpoint; a 1-token
    /// completion against the default online model is the cheapest call that
    /// verifies both auth and reachability.
    pub async fn health_check(&self) -> Result<(), AdapterError> {
        let probe = json!({
            "model": "llama-3.1-sonar-large-128k-online",
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&probe)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Provider, Request};
    use chrono::Utc;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model() -> ModelConfiguration {
        let mut m = ModelConfiguration::fallback();
        m.provider = Provider::Perplexity;
        m.model_name = "llama-3.1-sonar-large-128k-online".into();
        m
    }

    fn enriched(prompt: &str) -> EnrichedRequest {
        EnrichedRequest { request_id: Uuid::new_v4(), timestamp: Utc::now(), inner: Request::new("u1", prompt) }
    }

    #[tokio::test]
    async fn generate_returns_content_and_reported_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "answer with citations" } }],
                "usage": { "total_tokens": 20 },
            })))
            .mount(&server)
            .await;

        let adapter = PerplexityAdapter::with_base_url(server.uri(), "pplx-test".into(), 5_000);
        let outcome = adapter.generate(&enriched("what's new"), &model()).await.unwrap();
        assert_eq!(outcome.content, "answer with citations");
        assert_eq!(outcome.tokens_used, 20);
    }

    #[tokio::test]
    async fn rate_limited_status_maps_to_rate_limited_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let adapter = PerplexityAdapter::with_base_url(server.uri(), "pplx-test".into(), 5_000);
        let err = adapter.generate(&enriched("hi"), &model()).await.unwrap_err();
        assert!(matches!(err, AdapterError::RateLimited(_)));
    }

    #[tokio::test]
    async fn health_check_ok_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "pong" } }],
                "usage": { "total_tokens": 1 },
            })))
            .mount(&server)
            .await;

        let adapter = PerplexityAdapter::with_base_url(server.uri(), "pplx-test".into(), 5_000);
        assert!(adapter.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn health_check_fails_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let adapter = PerplexityAdapter::with_base_url(server.uri(), "pplx-test".into(), 5_000);
        assert!(adapter.health_check().await.is_err());
    }
}
