use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod backends;
mod budget;
mod cache;
mod circuit;
mod config;
mod error;
mod gateway;
mod models;
mod rate_limit;
mod routing;
mod secrets;
mod state;
mod usage;

pub use config::Config;
pub use error::AppError;
pub use gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/llm-gateway/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        client_port = config.gateway.client_port,
        admin_port = config.gateway.admin_port,
        models = config.models.len(),
        "llm-gateway starting"
    );

    let config = Arc::new(config);
    let config_manager = Arc::new(config::ConfigManager::new(Arc::clone(&config), config_path.clone()));

    let secrets = Arc::new(secrets::SecretResolver::new());
    let cache = Arc::new(cache::Cache::new(
        Duration::from_secs(config.gateway.cache_ttl_secs),
        config.gateway.cache_max_entries,
    ));
    let circuit = Arc::new(circuit::CircuitBreaker::new(
        config.gateway.circuit_failure_threshold,
        Duration::from_secs(config.gateway.circuit_cooldown_secs),
        Duration::from_secs(config.gateway.circuit_cooldown_max_secs),
    ));
    let budget = Arc::new(budget::BudgetManager::new(
        config.gateway.budget_enforcement,
        config.gateway.global_monthly_budget,
        config.gateway.global_daily_budget_fraction,
    ));
    let rate_limiter = Arc::new(rate_limit::RateLimiter::new());
    let usage_log = Arc::new(usage::UsageLog::new(config.gateway.usage_log_capacity));
    let decision_log = Arc::new(usage::DecisionLog::new(config.gateway.usage_log_capacity));

    // Fail startup if a configured, active, non-fallback model's credential
    // cannot be resolved — §4.1: resolution failure for an active model is
    // fatal at startup, not merely a routing exclusion.
    for model in config.get_active_models() {
        if let Some(secret_ref) = model.api_key_ref() {
            secrets
                .resolve(&secret_ref)
                .await
                .with_context(|| format!("resolving credential for active model `{}`", model.model_id))?;
        }
    }

    let gateway = Arc::new(gateway::Gateway::new(
        Arc::clone(&config_manager),
        Arc::clone(&secrets),
        Arc::clone(&cache),
        Arc::clone(&circuit),
        Arc::clone(&budget),
        Arc::clone(&rate_limiter),
        Arc::clone(&usage_log),
        Arc::clone(&decision_log),
    ));

    let state = Arc::new(state::AppState::new(
        &config,
        Arc::clone(&gateway),
        Arc::clone(&config_manager),
        Arc::clone(&usage_log),
        Arc::clone(&decision_log),
        Arc::clone(&circuit),
    ));

    // Spawn hot-reload watcher — polls the config file every 5 seconds.
    tokio::spawn(config_watcher(Arc::clone(&config_manager), Arc::clone(&gateway)));

    let client_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.client_port).parse()?;
    let admin_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.admin_port).parse()?;

    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let client_listener = tokio::net::TcpListener::bind(client_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = api::client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::client_auth::client_auth_middleware,
        ))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    let admin_app = api::admin::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::admin_auth::admin_auth_middleware,
        ))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(client_listener, client_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `llm-gateway --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("GATEWAY_CLIENT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// change. Uses filesystem `mtime` for change detection — no inotify/kqueue
/// dependencies. Parse failures are logged and ignored; the running config is
/// unchanged. A reload that leaves the gateway with zero resolvable active
/// models marks it not-ready rather than serving a half-broken config.
async fn config_watcher(manager: Arc<config::ConfigManager>, gateway: Arc<gateway::Gateway>) {
    let path = manager.config_path.clone();

    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(&path) {
            Ok(new_config) => {
                manager.replace_config(Arc::new(new_config)).await;
                gateway.set_ready(true);
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}
