//! Google Gemini `generateContent` adapter.
//!
//! Translates between the gateway's neutral request shape and Gemini's wire
//! format, mirroring the teacher's Anthropic adapter: same auth-header and
//! response-shape differences, handled at the edges so the rest of the
//! gateway never has to know Gemini exists.
//!
//! # Protocol differences handled here
//!
//! | Concern | Gateway | Gemini |
//! |---|---|---|
//! | Auth | n/a | `?key=` query parameter, not a header |
//! | Prompt | flat string | `contents[].parts[].text` |
//! | Max tokens | `max_tokens` | `generationConfig.maxOutputTokens` |
//! | Response shape | `content` | `candidates[0].content.parts[0].text` |
//! | Token usage | n/a | `usageMetadata.totalTokenCount` |

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use super::{estimate_tokens, AdapterOutcome};
use crate::config::ModelConfiguration;
use crate::error::AdapterError;
use crate::models::EnrichedRequest;

pub struct GeminiAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    model_name: String,
}

impl GeminiAdapter {
    pub fn new(api_key: String, model_name: String, timeout_ms: u64) -> Self {
        Self::with_base_url(
            "https://generativelanguage.googleapis.com".to_string(),
            api_key,
            model_name,
            timeout_ms,
        )
    }

    pub fn with_base_url(base_url: String, api_key: String, model_name: String, timeout_ms: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self { client, base_url: base_url.trim_end_matches('/').to_string(), api_key, model_name }
    }

    pub async fn generate(
        &self,
        request: &EnrichedRequest,
        model: &ModelConfiguration,
    ) -> Result<AdapterOutcome, AdapterError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": request.prompt }] }],
            "generationConfig": {
                "maxOutputTokens": request.max_tokens.unwrap_or(model.max_tokens),
                "temperature": request.temperature.unwrap_or(model.temperature),
            },
        });

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model_name, self.api_key
        );

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
            .map_err(|e| AdapterError::Fatal(format!("parsing Gemini response: {e}")))?;

        let content = parsed["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| AdapterError::Fatal("no text part in Gemini response".into()))?
            .to_string();

        let tokens_used = parsed["usageMetadata"]["totalTokenCount"]
            .as_u64()
            .map(|t| t as u32)
            .unwrap_or_else(|| estimate_tokens(&request.prompt, &content));

        Ok(AdapterOutcome { content, tokens_used })
    }

    /// Gemini has no dedicated health endpoint; `models.get` on the configured
    /// model is the cheapest call that validates both the key and model name.
    pub async fn health_check(&self) -> Result<(), AdapterError> {
        let url = format!("{}/v1beta/models/{}?key={}", self.base_url, self.model_name, self.api_key);
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
        m.provider = Provider::Gemini;
        m.model_name = "gemini-pro".into();
        m
    }

    fn enriched(prompt: &str) -> EnrichedRequest {
        EnrichedRequest { request_id: Uuid::new_v4(), timestamp: Utc::now(), inner: Request::new("u1", prompt) }
    }

    #[tokio::test]
    async fn generate_extracts_text_from_nested_candidate_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "hi from gemini" }] } }],
                "usageMetadata": { "totalTokenCount": 12 },
            })))
            .mount(&server)
            .await;

        let adapter =
            GeminiAdapter::with_base_url(server.uri(), "key".into(), "gemini-pro".into(), 5_000);
        let outcome = adapter.generate(&enriched("hello"), &model()).await.unwrap();
        assert_eq!(outcome.content, "hi from gemini");
        assert_eq!(outcome.tokens_used, 12);
    }

    #[tokio::test]
    async fn generate_estimates_tokens_when_usage_metadata_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "abcd" } ] } }],
            })))
            .mount(&server)
            .await;

        let adapter =
            GeminiAdapter::with_base_url(server.uri(), "key".into(), "gemini-pro".into(), 5_000);
        let outcome = adapter.generate(&enriched("ab"), &model()).await.unwrap();
        assert_eq!(outcome.tokens_used, estimate_tokens("ab", "abcd"));
    }

    #[tokio::test]
    async fn missing_text_part_is_a_fatal_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
            .mount(&server)
            .await;

        let adapter =
            GeminiAdapter::with_base_url(server.uri(), "key".into(), "gemini-pro".into(), 5_000);
        let err = adapter.generate(&enriched("hi"), &model()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Fatal(_)));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let adapter =
            GeminiAdapter::with_base_url(server.uri(), "key".into(), "gemini-pro".into(), 5_000);
        let err = adapter.generate(&enriched("hi"), &model()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Auth(_)));
    }

    #[tokio::test]
    async fn health_check_ok_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1beta/models/gemini-pro"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "gemini-pro" })))
            .mount(&server)
            .await;

        let adapter =
            GeminiAdapter::with_base_url(server.uri(), "key".into(), "gemini-pro".into(), 5_000);
        assert!(adapter.health_check().await.is_ok());
    }
}
