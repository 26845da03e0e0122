//! Configuration types and the live configuration snapshot manager.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. [`ConfigManager`] then holds
//! the active snapshot behind a narrow `RwLock` so readers never block on
//! writers for longer than an `Arc::clone`, and a background task can swap in
//! a freshly-reloaded snapshot atomically.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//!
//! [models.gpt-4]
//! provider = "openai"
//! model_name = "gpt-4"
//! api_key_env = "OPENAI_API_KEY"
//! priority = "high"
//! cost_per_token = "0.00003"
//! max_tokens = 8192
//!
//! [[routing_rules]]
//! task_type = "chat"
//! candidates = ["gpt-4", "fallback"]
//! ```

use std::{collections::HashMap, path::{Path, PathBuf}, sync::Arc};

use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::models::{ModelPriority, Provider, RequestPriority, UserTier};
use crate::secrets::SecretRef;

/// A single configured model endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfiguration {
    /// Unique identifier used in routing rules and usage records.
    pub model_id: String,

    pub provider: Provider,

    /// Model name as understood by the provider's API.
    pub model_name: String,

    /// Environment variable holding this model's API key. Translated into a
    /// [`SecretRef`] at load time; absent for the fallback provider.
    #[serde(default)]
    pub api_key_env: Option<String>,

    pub priority: ModelPriority,

    /// Cost in USD per token, as a fixed-point decimal to avoid floating
    /// point drift in billing paths.
    pub cost_per_token: Decimal,

    pub max_tokens: u32,

    #[serde(default = "defaults::temperature")]
    pub temperature: f32,

    #[serde(default = "defaults::is_active")]
    pub is_active: bool,
}

impl ModelConfiguration {
    pub fn api_key_ref(&self) -> Option<SecretRef> {
        self.api_key_env.as_deref().map(SecretRef::env)
    }

    /// The synthesized configuration used when no model is configured, or as
    /// the last resort in the adapter failover chain.
    pub fn fallback() -> Self {
        Self {
            model_id: "fallback".into(),
            provider: Provider::Fallback,
            model_name: "fallback".into(),
            api_key_env: None,
            priority: ModelPriority::Fallback,
            cost_per_token: Decimal::ZERO,
            max_tokens: 1_000,
            temperature: 0.7,
            is_active: true,
        }
    }
}

/// One entry in the routing table: a predicate over request context plus an
/// ordered candidate list.
///
/// `None` fields match any value. Rules are evaluated in declaration order;
/// the routing engine narrows/reorders the candidate set with each matching
/// rule, so later rules take precedence in conflicts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub user_tier: Option<UserTier>,
    #[serde(default)]
    pub priority: Option<RequestPriority>,
    /// Ordered model ids this rule prefers, highest preference first.
    pub candidates: Vec<String>,
}

impl RoutingRule {
    pub fn matches(&self, task_type: &str, tier: UserTier, priority: RequestPriority) -> bool {
        self.task_type.as_deref().is_none_or(|t| t == task_type)
            && self.user_tier.is_none_or(|t| t == tier)
            && self.priority.is_none_or(|p| p == priority)
    }
}

/// Static per-tier quota table. Seeded with the values carried over from the
/// original tier catalogue (`free` / `premium` / `enterprise`); operators can
/// override any tier in the `[tier_limits.*]` config sections.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TierLimits {
    pub daily_limit: u32,
    pub weekly_limit: u32,
    pub monthly_limit: u32,
    pub monthly_budget: Decimal,
}

impl TierLimits {
    pub fn for_tier(tier: UserTier) -> Self {
        match tier {
            UserTier::Free => Self {
                daily_limit: 10,
                weekly_limit: 50,
                monthly_limit: 200,
                monthly_budget: Decimal::new(500, 2), // 5.00
            },
            UserTier::Premium => Self {
                daily_limit: 50,
                weekly_limit: 300,
                monthly_limit: 1_000,
                monthly_budget: Decimal::new(2_500, 2), // 25.00
            },
            UserTier::Enterprise => Self {
                daily_limit: 1_000,
                weekly_limit: 5_000,
                monthly_limit: 20_000,
                monthly_budget: Decimal::new(10_000, 2), // 100.00
            },
        }
    }
}

/// Whether budget rejections are enforced or merely logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetEnforcement {
    #[default]
    Strict,
    Soft,
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the application-facing client API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Number of recent requests to keep in the in-memory usage log (default: 500).
    #[serde(default = "defaults::usage_log_capacity")]
    pub usage_log_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Environment variable whose value is the Bearer token required for all
    /// admin API requests. Leave unset to disable admin authentication (only
    /// recommended when the admin port is strictly firewalled).
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Per-request deadline in milliseconds (default: 30 000).
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum concurrent in-flight adapter calls per model (default: 64).
    #[serde(default = "defaults::per_model_concurrency")]
    pub per_model_concurrency: usize,

    /// Cache entry time-to-live in seconds (default: 300).
    #[serde(default = "defaults::cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum cached entries before LRU eviction kicks in (default: 10 000).
    #[serde(default = "defaults::cache_max_entries")]
    pub cache_max_entries: usize,

    /// Consecutive failures before a model's circuit opens (default: 5).
    #[serde(default = "defaults::circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Initial open-circuit cooldown in seconds (default: 30).
    #[serde(default = "defaults::circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,

    /// Cap on the exponentially-backed-off cooldown (default: 300).
    #[serde(default = "defaults::circuit_cooldown_max_secs")]
    pub circuit_cooldown_max_secs: u64,

    /// Requests allowed per route class per client per hour (default: 20).
    #[serde(default = "defaults::rate_limit_per_hour")]
    pub rate_limit_per_hour: u32,

    /// Strict (reject) or soft (log-only) budget enforcement.
    #[serde(default)]
    pub budget_enforcement: BudgetEnforcement,

    /// Global monthly budget cap across all users, in USD. `None` disables
    /// the global budget check.
    #[serde(default)]
    pub global_monthly_budget: Option<Decimal>,

    /// Fraction of the daily slice of `global_monthly_budget` that, once
    /// reached, causes non-critical requests to be rejected (default: 0.9).
    #[serde(default = "defaults::global_daily_budget_fraction")]
    pub global_daily_budget_fraction: f64,

    /// Default provider bias used to pick the seed model set when no models
    /// are explicitly configured (`openai`|`gemini`|`perplexity`|`fallback`).
    #[serde(default)]
    pub default_provider: Provider,
}

/// Maps one client API key (resolved from an env var) to the principal and
/// tier the gateway should attribute requests bearing it to.
///
/// Every downstream component (budget, rate limiter, routing) keys off
/// `user_id`, so this maps `key -> user_id` rather than `key -> profile name`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientKeyConfig {
    /// Environment variable holding the bearer key value.
    pub key_env: String,
    /// The `user_id` attributed to requests authenticated with this key.
    pub user_id: String,
    /// Tier override for this principal. Falls back to `UserTier::default()`
    /// (`Free`) when absent.
    #[serde(default)]
    pub tier: Option<UserTier>,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub gateway: GatewayConfig,

    /// Configured models, keyed by `model_id`.
    #[serde(default)]
    pub models: HashMap<String, ModelConfiguration>,

    /// Ordered routing rules, evaluated in declaration order.
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,

    /// Per-tier quota overrides. Tiers absent here fall back to
    /// [`TierLimits::for_tier`].
    #[serde(default)]
    pub tier_limits: HashMap<UserTier, TierLimits>,

    /// Client API keys recognized on the client port. Empty means the
    /// bearer-token gate is disabled (every request is accepted as-is; the
    /// caller must supply `user_id` in the request body).
    #[serde(default)]
    pub clients: Vec<ClientKeyConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        config.ensure_fallback_present();
        Ok(config)
    }

    /// Parse from an in-memory TOML string (used by the default-config seed
    /// and by tests).
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content).context("parsing config TOML")?;
        config.validate()?;
        config.ensure_fallback_present();
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (id, model) in &self.models {
            anyhow::ensure!(
                id == &model.model_id,
                "model key `{id}` does not match its own `model_id` field `{}`",
                model.model_id
            );
            if model.provider != Provider::Fallback {
                anyhow::ensure!(
                    model.api_key_env.is_some(),
                    "model `{id}` uses provider `{}` and must set `api_key_env`",
                    model.provider
                );
            }
        }

        let model_ids: std::collections::HashSet<&str> =
            self.models.keys().map(|k| k.as_str()).collect();
        for rule in &self.routing_rules {
            for candidate in &rule.candidates {
                anyhow::ensure!(
                    model_ids.contains(candidate.as_str()) || candidate == "fallback",
                    "routing rule references unknown model `{candidate}`"
                );
            }
        }

        Ok(())
    }

    /// If no active model is configured, synthesize the zero-cost fallback —
    /// the gateway must never be left with zero admissible models.
    fn ensure_fallback_present(&mut self) {
        let has_active = self.models.values().any(|m| m.is_active);
        if !has_active {
            let fb = ModelConfiguration::fallback();
            self.models.insert(fb.model_id.clone(), fb);
        }
    }

    /// All active models, ordered by descending priority then ascending
    /// `model_id` for determinism.
    pub fn get_active_models(&self) -> Vec<&ModelConfiguration> {
        let mut models: Vec<&ModelConfiguration> =
            self.models.values().filter(|m| m.is_active).collect();
        models.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.model_id.cmp(&b.model_id)));
        models
    }

    /// Routing rules matching the given request context, in declaration order.
    pub fn get_matching_rules(
        &self,
        task_type: &str,
        tier: UserTier,
        priority: RequestPriority,
    ) -> Vec<&RoutingRule> {
        self.routing_rules.iter().filter(|r| r.matches(task_type, tier, priority)).collect()
    }

    pub fn tier_limits(&self, tier: UserTier) -> TierLimits {
        self.tier_limits.get(&tier).copied().unwrap_or_else(|| TierLimits::for_tier(tier))
    }
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn usage_log_capacity() -> usize { 500 }
    pub fn request_timeout_ms() -> u64 { 30_000 }
    pub fn per_model_concurrency() -> usize { 64 }
    pub fn cache_ttl_secs() -> u64 { 300 }
    pub fn cache_max_entries() -> usize { 10_000 }
    pub fn circuit_failure_threshold() -> u32 { 5 }
    pub fn circuit_cooldown_secs() -> u64 { 30 }
    pub fn circuit_cooldown_max_secs() -> u64 { 300 }
    pub fn rate_limit_per_hour() -> u32 { 20 }
    pub fn global_daily_budget_fraction() -> f64 { 0.9 }
    pub fn temperature() -> f32 { 0.7 }
    pub fn is_active() -> bool { true }
}

/// Holds the live configuration snapshot and mediates hot reload.
///
/// Readers call [`ConfigManager::config`] to get an `Arc<Config>` clone — the
/// lock is held only for the duration of that clone, so readers never
/// contend with each other and barely contend with the rare writer. The
/// `RwLock` guards only the pointer swap, never the data itself.
pub struct ConfigManager {
    config_lock: RwLock<Arc<Config>>,
    pub config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Arc<Config>, config_path: PathBuf) -> Self {
        Self { config_lock: RwLock::new(config), config_path }
    }

    /// Current configuration snapshot. Cheap: one `Arc` clone under a brief
    /// read lock.
    pub async fn config(&self) -> Arc<Config> {
        Arc::clone(&*self.config_lock.read().await)
    }

    /// Atomically replace the active configuration snapshot.
    pub async fn replace_config(&self, new_config: Arc<Config>) {
        *self.config_lock.write().await = new_config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config::from_toml_str(
            r#"
            [gateway]
            client_port = 8080

            [models.gpt-4]
            model_id = "gpt-4"
            provider = "openai"
            model_name = "gpt-4"
            api_key_env = "OPENAI_API_KEY"
            priority = "high"
            cost_per_token = "0.00003"
            max_tokens = 8192

            [[routing_rules]]
            task_type = "chat"
            candidates = ["gpt-4"]
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn validation_rejects_non_fallback_model_without_api_key_env() {
        let bad = Config::from_toml_str(
            r#"
            [gateway]
            [models.gpt-4]
            model_id = "gpt-4"
            provider = "openai"
            model_name = "gpt-4"
            priority = "high"
            cost_per_token = "0.00003"
            max_tokens = 8192
            "#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn validation_rejects_routing_rule_with_unknown_candidate() {
        let bad = Config::from_toml_str(
            r#"
            [gateway]
            [[routing_rules]]
            candidates = ["nonexistent"]
            "#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn fallback_is_synthesized_when_no_active_models_configured() {
        let config = Config::from_toml_str("[gateway]\n").unwrap();
        assert!(config.models.contains_key("fallback"));
        assert_eq!(config.get_active_models().len(), 1);
    }

    #[test]
    fn fallback_not_duplicated_when_active_model_exists() {
        let config = minimal_config();
        assert!(!config.models.contains_key("fallback"));
        assert_eq!(config.get_active_models().len(), 1);
    }

    #[test]
    fn get_active_models_orders_by_descending_priority() {
        let config = Config::from_toml_str(
            r#"
            [gateway]
            [models.low-model]
            model_id = "low-model"
            provider = "fallback"
            model_name = "low"
            priority = "low"
            cost_per_token = "0.0"
            max_tokens = 100

            [models.high-model]
            model_id = "high-model"
            provider = "fallback"
            model_name = "high"
            priority = "critical"
            cost_per_token = "0.0"
            max_tokens = 100
            "#,
        )
        .unwrap();
        let active = config.get_active_models();
        assert_eq!(active[0].model_id, "high-model");
        assert_eq!(active[1].model_id, "low-model");
    }

    #[test]
    fn routing_rule_matches_wildcard_fields() {
        let rule = RoutingRule {
            task_type: None,
            user_tier: None,
            priority: None,
            candidates: vec!["x".into()],
        };
        assert!(rule.matches("anything", UserTier::Enterprise, RequestPriority::Critical));
    }

    #[test]
    fn routing_rule_does_not_match_wrong_task_type() {
        let rule = RoutingRule {
            task_type: Some("chat".into()),
            user_tier: None,
            priority: None,
            candidates: vec!["x".into()],
        };
        assert!(!rule.matches("workout", UserTier::Free, RequestPriority::Normal));
    }

    #[tokio::test]
    async fn config_manager_reflects_replaced_snapshot() {
        let initial = Arc::new(minimal_config());
        let manager = ConfigManager::new(Arc::clone(&initial), PathBuf::from("/tmp/none.toml"));
        assert_eq!(manager.config().await.gateway.client_port, 8080);

        let mut replaced = (*initial).clone();
        replaced.gateway.client_port = 9999;
        manager.replace_config(Arc::new(replaced)).await;
        assert_eq!(manager.config().await.gateway.client_port, 9999);
    }

    #[test]
    fn tier_limits_fall_back_to_static_table() {
        let config = minimal_config();
        let limits = config.tier_limits(UserTier::Free);
        assert_eq!(limits.daily_limit, 10);
        assert_eq!(limits.monthly_limit, 200);
    }
}
