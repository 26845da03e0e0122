//! Backend client factory and unified dispatch interface.
//!
//! [`BackendClient`] is an enum that wraps a concrete provider adapter chosen
//! at construction time from a [`ModelConfiguration`]. All routing code
//! interacts with the same `generate`/`health_check` API; adapter-specific
//! protocol differences — schema translation, auth headers, endpoint paths —
//! are fully encapsulated in the adapter modules.

mod fallback;
mod gemini;
mod openai;
mod perplexity;

pub use fallback::FallbackAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAIAdapter;
pub use perplexity::PerplexityAdapter;

use rust_decimal::Decimal;

use crate::config::ModelConfiguration;
use crate::error::AdapterError;
use crate::models::EnrichedRequest;
use crate::secrets::Secret;

/// Result of a successful adapter call, before cost/latency are attached by
/// the facade.
#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub content: String,
    /// Tokens used as reported by the provider, or estimated if the provider
    /// response carried no usage block.
    pub tokens_used: u32,
}

/// Deterministic fallback token estimator used when a provider response
/// carries no usage block: `ceil((len(prompt)+len(content))/4)`.
pub fn estimate_tokens(prompt: &str, content: &str) -> u32 {
    let chars = prompt.len() + content.len();
    ((chars + 3) / 4) as u32
}

pub fn estimate_cost(model: &ModelConfiguration, tokens_used: u32) -> Decimal {
    model.cost_per_token * Decimal::from(tokens_used)
}

/// Unified backend client — enum dispatch over concrete provider adapters.
pub enum BackendClient {
    OpenAI(OpenAIAdapter),
    Gemini(GeminiAdapter),
    Perplexity(PerplexityAdapter),
    Fallback(FallbackAdapter),
}

impl BackendClient {
    /// Build a backend client for `model`, using `secret` as the resolved
    /// API key (absent for the fallback provider).
    pub fn new(model: &ModelConfiguration, secret: Option<Secret>) -> Result<Self, AdapterError> {
        use crate::models::Provider;

        Ok(match model.provider {
            Provider::OpenAI => {
                let key = secret.ok_or_else(|| {
                    AdapterError::Auth(format!("model `{}` requires an API key", model.model_id))
                })?;
                Self::OpenAI(OpenAIAdapter::new(key.expose().to_string(), 30_000))
            }
            Provider::Gemini => {
                let key = secret.ok_or_else(|| {
                    AdapterError::Auth(format!("model `{}` requires an API key", model.model_id))
                })?;
                Self::Gemini(GeminiAdapter::new(key.expose().to_string(), model.model_name.clone(), 30_000))
            }
            Provider::Perplexity => {
                let key = secret.ok_or_else(|| {
                    AdapterError::Auth(format!("model `{}` requires an API key", model.model_id))
                })?;
                Self::Perplexity(PerplexityAdapter::new(key.expose().to_string(), 30_000))
            }
            Provider::Fallback => Self::Fallback(FallbackAdapter::new()),
        })
    }

    pub async fn generate(
        &self,
        request: &EnrichedRequest,
        model: &ModelConfiguration,
    ) -> Result<AdapterOutcome, AdapterError> {
        match self {
            Self::OpenAI(a) => a.generate(request, model).await,
            Self::Gemini(a) => a.generate(request, model).await,
            Self::Perplexity(a) => a.generate(request, model).await,
            Self::Fallback(a) => a.generate(request, model).await,
        }
    }

    pub async fn health_check(&self) -> Result<(), AdapterError> {
        match self {
            Self::OpenAI(a) => a.health_check().await,
            Self::Gemini(a) => a.health_check().await,
            Self::Perplexity(a) => a.health_check().await,
            Self::Fallback(a) => a.health_check().await,
        }
    }
}
