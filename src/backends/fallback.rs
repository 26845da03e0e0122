//! Zero-cost canned-response adapter.
//!
//! The fallback model is always active and always healthy — it is the floor
//! the gateway can never fall through. It makes no network call and is never
//! gated by the circuit breaker in practice (its own `health_check` always
//! succeeds), so routing always has at least one admissible candidate.

use super::AdapterOutcome;
use crate::config::ModelConfiguration;
use crate::error::AdapterError;
use crate::models::EnrichedRequest;

const CANNED_RESPONSE: &str =
    "This request could not be routed to a configured model and was served by the fallback responder.";

#[derive(Default)]
pub struct FallbackAdapter;

impl FallbackAdapter {
    pub fn new() -> Self {
        Self
    }

    pub async fn generate(
        &self,
        _request: &EnrichedRequest,
        _model: &ModelConfiguration,
    ) -> Result<AdapterOutcome, AdapterError> {
        Ok(AdapterOutcome { content: CANNED_RESPONSE.to_string(), tokens_used: 0 })
    }

    pub async fn health_check(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Request;
    use chrono::Utc;
    use uuid::Uuid;

    fn enriched() -> EnrichedRequest {
        EnrichedRequest {
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            inner: Request::new("u1", "hello"),
        }
    }

    #[tokio::test]
    async fn generate_reports_zero_tokens() {
        let adapter = FallbackAdapter::new();
        let outcome = adapter.generate(&enriched(), &ModelConfiguration::fallback()).await.unwrap();
        assert_eq!(outcome.tokens_used, 0);
        assert!(!outcome.content.is_empty());
    }

    #[tokio::test]
    async fn health_check_always_succeeds() {
        let adapter = FallbackAdapter::new();
        assert!(adapter.health_check().await.is_ok());
    }
}
