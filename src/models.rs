//! Data types that flow through the gateway pipeline.
//!
//! These are the shapes every component (cache, budget, routing, usage
//! logger, adapters) agrees on. Nothing here talks to the network or to a
//! lock — it's the vocabulary, not the machinery.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered user entitlement tier. Ordering matters: `Free < Premium < Enterprise`
/// drives both tier-limit lookups and routing priority preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Free,
    Premium,
    Enterprise,
}

impl std::fmt::Display for UserTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        })
    }
}

/// Declared request priority. Distinct from [`ModelPriority`] — this is what
/// the *caller* asks for; model priority is a property of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    #[default]
    Normal,
    High,
    Critical,
}

/// Priority assigned to a [`crate::config::ModelConfiguration`]. Ordered so the
/// routing engine can prefer higher-priority candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPriority {
    Fallback,
    Low,
    Medium,
    High,
    Critical,
}

/// Which upstream a [`crate::config::ModelConfiguration`] talks to.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAI,
    Gemini,
    Perplexity,
    /// Zero-cost canned responder, always available. Guarantees the gateway
    /// stays serviceable even with no third-party credentials configured.
    #[default]
    Fallback,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAI => "openai",
            Self::Gemini => "gemini",
            Self::Perplexity => "perplexity",
            Self::Fallback => "fallback",
        })
    }
}

/// An inbound request, as received by the facade.
#[derive(Debug, Clone)]
pub struct Request {
    pub prompt: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub task_type: String,
    pub user_tier: UserTier,
    pub priority: RequestPriority,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
    pub metadata: HashMap<String, String>,
}

impl Request {
    /// Minimal constructor for programmatic / test callers.
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            user_id: user_id.into(),
            session_id: None,
            task_type: "general".into(),
            user_tier: UserTier::Free,
            priority: RequestPriority::Normal,
            max_tokens: None,
            temperature: None,
            stream: false,
            metadata: HashMap::new(),
        }
    }
}

/// A request after [`crate::gateway::Gateway`] validation & enrichment.
/// Immutable for the rest of the pipeline's lifetime.
#[derive(Debug, Clone)]
pub struct EnrichedRequest {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub inner: Request,
}

impl std::ops::Deref for EnrichedRequest {
    type Target = Request;
    fn deref(&self) -> &Request {
        &self.inner
    }
}

/// Outcome of a successful [`crate::gateway::Gateway::process`] call.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub request_id: Uuid,
    pub content: String,
    pub model_id_used: String,
    pub provider: Provider,
    pub tokens_used: u32,
    pub cost_estimate: Decimal,
    pub latency_ms: u64,
    pub cached: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Append-only accounting row for one request, owned by the usage logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub user_id: String,
    pub model_id: String,
    pub provider: Provider,
    pub tokens_used: u32,
    pub cost_estimate: Decimal,
    pub latency_ms: u64,
    pub cached: bool,
    pub task_type: String,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub error_kind: Option<String>,
}

/// One candidate that the routing engine rejected, and why. Feeds
/// [`DecisionReceipt`] for audit/debugging.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedCandidate {
    pub model_id: String,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    Budget,
    Rate,
    CircuitOpen,
    Inactive,
}

/// Optional audit trail of one routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionReceipt {
    pub request_id: Uuid,
    pub selected_model_id: Option<String>,
    pub rejected: Vec<RejectedCandidate>,
    pub explanation: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_tier_orders_ascending() {
        assert!(UserTier::Free < UserTier::Premium);
        assert!(UserTier::Premium < UserTier::Enterprise);
    }

    #[test]
    fn model_priority_orders_ascending() {
        assert!(ModelPriority::Fallback < ModelPriority::Low);
        assert!(ModelPriority::High < ModelPriority::Critical);
    }

    #[test]
    fn request_new_has_sane_defaults() {
        let r = Request::new("u1", "hello");
        assert_eq!(r.user_tier, UserTier::Free);
        assert!(!r.stream);
        assert_eq!(r.task_type, "general");
    }
}
