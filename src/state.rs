//! Shared state handed to every HTTP handler via `axum::extract::State`.
//!
//! Everything the handlers need is resolved once at startup (admin token,
//! client key map) and the rest is just `Arc`-cloned access to the
//! long-lived subsystems [`Gateway`] itself already owns. `AppState` does
//! not duplicate gateway internals — `usage_log`, `decision_log`, and
//! `circuit` are the same `Arc`s passed into [`Gateway::new`], kept here too
//! so admin introspection endpoints can read them without the facade
//! needing to grow admin-only accessors.

use std::{collections::HashMap, sync::Arc, time::Instant};

use crate::circuit::CircuitBreaker;
use crate::config::{Config, ConfigManager};
use crate::gateway::Gateway;
use crate::models::UserTier;
use crate::usage::{DecisionLog, UsageLog};

/// The principal a client API key resolves to.
#[derive(Debug, Clone)]
pub struct ClientPrincipal {
    pub user_id: String,
    pub tier: UserTier,
}

pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub config: Arc<ConfigManager>,
    pub usage_log: Arc<UsageLog>,
    pub decision_log: Arc<DecisionLog>,
    pub circuit: Arc<CircuitBreaker>,
    pub started_at: Instant,

    /// Bearer token required on every admin route. `None` disables admin auth
    /// (the admin port should then be firewalled).
    pub admin_token: Option<String>,

    /// Maps resolved client API key values to the principal making the
    /// request. Empty means the client port's bearer gate is disabled —
    /// every request must supply its own `user_id`.
    pub client_map: HashMap<String, ClientPrincipal>,
}

impl AppState {
    pub fn new(
        initial_config: &Config,
        gateway: Arc<Gateway>,
        config: Arc<ConfigManager>,
        usage_log: Arc<UsageLog>,
        decision_log: Arc<DecisionLog>,
        circuit: Arc<CircuitBreaker>,
    ) -> Self {
        let admin_token = initial_config
            .gateway
            .admin_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());

        let client_map: HashMap<String, ClientPrincipal> = initial_config
            .clients
            .iter()
            .filter_map(|c| {
                let key = std::env::var(&c.key_env).ok().filter(|k| !k.is_empty())?;
                Some((key, ClientPrincipal { user_id: c.user_id.clone(), tier: c.tier.unwrap_or(UserTier::Free) }))
            })
            .collect();
        if !client_map.is_empty() {
            tracing::info!(count = client_map.len(), "loaded client key mappings");
        }

        Self { gateway, config, usage_log, decision_log, circuit, started_at: Instant::now(), admin_token, client_map }
    }
}
