//! The gateway facade — composes every other component into one request
//! pipeline.
//!
//! [`Gateway::process`] is the single entry point the HTTP layer (and any
//! other embedder) calls. Everything upstream of it — validation, cache,
//! rate limiting, budget, routing, adapter invocation with failover,
//! recording — happens here, in a fixed order, so the pipeline's behavior is
//! auditable from this one file rather than scattered across handlers.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;

use crate::backends::{estimate_cost, BackendClient};
use crate::budget::BudgetManager;
use crate::cache::{fingerprint, Cache};
use crate::circuit::CircuitBreaker;
use crate::config::{Config, ConfigManager, ModelConfiguration};
use crate::error::{AdapterError, GatewayError};
use crate::models::{DecisionReceipt, EnrichedRequest, RejectedCandidate, RejectionReason, Request, Response, UsageRecord};
use crate::rate_limit::RateLimiter;
use crate::routing::{self, RoutingError};
use crate::secrets::SecretResolver;
use crate::usage::{DecisionLog, UsageLog};

/// Every cooperating subsystem the facade orchestrates, wired together once
/// at startup and shared across all request tasks via `Arc`.
pub struct Gateway {
    config: Arc<ConfigManager>,
    secrets: Arc<SecretResolver>,
    cache: Arc<Cache>,
    circuit: Arc<CircuitBreaker>,
    budget: Arc<BudgetManager>,
    rate_limiter: Arc<RateLimiter>,
    usage_log: Arc<UsageLog>,
    decision_log: Arc<DecisionLog>,
    /// Lazily constructed, reused across requests — building a
    /// `BackendClient` stands up a `reqwest::Client`, which is meant to be
    /// long-lived rather than rebuilt per call.
    backends: DashMap<String, Arc<BackendClient>>,
    /// Per-model concurrency bound. Built lazily so limits are keyed by
    /// `model_id`, matching the circuit breaker's and budget manager's
    /// per-key shape.
    semaphores: DashMap<String, Arc<Semaphore>>,
    ready: AtomicBool,
}

impl Gateway {
    pub fn new(
        config: Arc<ConfigManager>,
        secrets: Arc<SecretResolver>,
        cache: Arc<Cache>,
        circuit: Arc<CircuitBreaker>,
        budget: Arc<BudgetManager>,
        rate_limiter: Arc<RateLimiter>,
        usage_log: Arc<UsageLog>,
        decision_log: Arc<DecisionLog>,
    ) -> Self {
        Self {
            config,
            secrets,
            cache,
            circuit,
            budget,
            rate_limiter,
            usage_log,
            decision_log,
            backends: DashMap::new(),
            semaphores: DashMap::new(),
            ready: AtomicBool::new(true),
        }
    }

    /// Administratively mark the gateway unready — used during a broken
    /// config reload, or before startup dependencies finish probing. All
    /// `process` calls fail fast with `NotReady` while this is set.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Run one request through the full pipeline.
    pub async fn process(&self, request: Request) -> Result<Response, GatewayError> {
        // Step 1: initialization guard.
        if !self.is_ready() {
            return Err(GatewayError::NotReady);
        }

        // Step 2: validate & enrich.
        let enriched = self.validate_and_enrich(request)?;
        let config = self.config.config().await;

        // Step 3: cache lookup.
        let fp = fingerprint(&enriched.inner);
        if let Some(mut cached) = self.cache.get(&fp) {
            cached.request_id = enriched.request_id;
            cached.cached = true;
            self.usage_log.push(cache_hit_record(&enriched, &cached));
            return Ok(cached);
        }

        // Single-flight: only the leader actually runs the pipeline past
        // this point; followers re-check the cache once the leader is done.
        let guard = self.cache.single_flight(&fp).await;
        if !guard.is_leader() {
            if let Some(mut cached) = self.cache.get(&fp) {
                cached.request_id = enriched.request_id;
                cached.cached = true;
                self.usage_log.push(cache_hit_record(&enriched, &cached));
                return Ok(cached);
            }
            // The leader's attempt failed (no value to serve); fall through
            // and run the pipeline ourselves rather than serving nothing.
        }

        let result = self.process_uncached(&enriched, &config, &fp).await;
        self.cache.release_single_flight(&fp);
        result
    }

    fn validate_and_enrich(&self, request: Request) -> Result<EnrichedRequest, GatewayError> {
        if request.prompt.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("prompt must not be empty".into()));
        }
        if let Some(max_tokens) = request.max_tokens {
            if max_tokens == 0 {
                return Err(GatewayError::InvalidRequest("max_tokens must be greater than zero".into()));
            }
        }

        Ok(EnrichedRequest {
            request_id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            inner: request,
        })
    }

    async fn process_uncached(
        &self,
        enriched: &EnrichedRequest,
        config: &Arc<Config>,
        fp: &str,
    ) -> Result<Response, GatewayError> {
        let started = Instant::now();

        // Step 4: rate limit.
        let rate_key = (enriched.task_type.clone(), enriched.user_id.clone());
        let window = Duration::from_secs(3600);
        if !self.rate_limiter.check(&rate_key, config.gateway.rate_limit_per_hour, window) {
            let retry_after_secs = self.rate_limiter.retry_after_secs(&rate_key, config.gateway.rate_limit_per_hour, window);
            self.usage_log.push(error_record(enriched, "RATE_LIMITED"));
            return Err(GatewayError::RateLimited { retry_after_secs });
        }

        // Step 5: budget admission.
        let limits = config.tier_limits(enriched.user_tier);
        let is_critical = enriched.priority == crate::models::RequestPriority::Critical;
        let (admission, mut slot) =
            self.budget.check(&enriched.user_id, enriched.user_tier, limits, is_critical).await;
        if !admission.allowed {
            self.usage_log.push(error_record(enriched, "BUDGET_EXCEEDED"));
            return Err(GatewayError::BudgetExceeded { limits_exceeded: admission.limits_exceeded });
        }

        // Step 6: routing.
        let active_models = config.get_active_models();
        let candidates: Vec<&str> = active_models
            .iter()
            .filter(|m| self.circuit.can_proceed(&m.model_id))
            .map(|m| m.model_id.as_str())
            .collect();

        let mut rejected: Vec<RejectedCandidate> = config
            .models
            .values()
            .filter(|m| !m.is_active)
            .map(|m| RejectedCandidate { model_id: m.model_id.clone(), reason: RejectionReason::Inactive })
            .collect();
        rejected.extend(active_models.iter().filter(|m| !candidates.contains(&m.model_id.as_str())).map(|m| {
            RejectedCandidate { model_id: m.model_id.clone(), reason: RejectionReason::CircuitOpen }
        }));

        let selected_id = match routing::select(config, &candidates, &enriched.task_type, enriched.user_tier, enriched.priority) {
            Ok(id) => id.to_string(),
            Err(RoutingError::NoModelAvailable) => {
                self.decision_log.push(DecisionReceipt {
                    request_id: enriched.request_id,
                    selected_model_id: None,
                    rejected,
                    explanation: "no active model with a closed circuit was available".into(),
                });
                self.usage_log.push(error_record(enriched, "NO_MODEL"));
                return Err(GatewayError::NoModel);
            }
        };

        self.decision_log.push(DecisionReceipt {
            request_id: enriched.request_id,
            selected_model_id: Some(selected_id.clone()),
            rejected: rejected.into_iter().filter(|r| r.model_id != selected_id).collect(),
            explanation: "selected by routing precedence (rule match, priority preference, then cost/priority tie-break)".into(),
        });

        // Step 7: adapter invocation with at-most-one failover attempt.
        let deadline = Duration::from_millis(config.gateway.request_timeout_ms);
        let outcome = self.invoke_with_failover(enriched, config, &selected_id, &candidates, deadline).await;

        match outcome {
            Ok((model, adapter_outcome)) => {
                let cost = estimate_cost(&model, adapter_outcome.tokens_used);
                let latency_ms = started.elapsed().as_millis() as u64;

                // Step 8: record.
                let response = Response {
                    request_id: enriched.request_id,
                    content: adapter_outcome.content,
                    model_id_used: model.model_id.clone(),
                    provider: model.provider,
                    tokens_used: adapter_outcome.tokens_used,
                    cost_estimate: cost,
                    latency_ms,
                    cached: false,
                    metadata: Default::default(),
                };

                self.cache.set(fp, response.clone()).await;
                self.budget.record(&mut slot, cost).await;
                self.usage_log.push(success_record(enriched, &response));
                self.circuit.record_success(&model.model_id);

                // Step 9: assemble (response already built above).
                Ok(response)
            }
            Err(failure) => {
                self.usage_log.push(error_record(enriched, failure.kind()));
                Err(failure)
            }
        }
    }

    /// Invoke the selected model, retrying at most once against the next
    /// candidate on a `Transient`/`RateLimited` error, then falling through
    /// to the fallback adapter on repeated failure or `Auth` errors.
    /// `ClientInvalid` is surfaced immediately without retrying.
    async fn invoke_with_failover(
        &self,
        enriched: &EnrichedRequest,
        config: &Arc<Config>,
        first_id: &str,
        candidates: &[&str],
        deadline: Duration,
    ) -> Result<(ModelConfiguration, crate::backends::AdapterOutcome), GatewayError> {
        let attempt_order = failover_order(first_id, candidates);
        let mut last_err: Option<GatewayError> = None;

        for (attempt, model_id) in attempt_order.iter().enumerate() {
            let Some(model) = config.models.get(*model_id).cloned() else { continue };

            let client = match self.backend_for(&model).await {
                Ok(client) => client,
                Err(e) => {
                    last_err = Some(GatewayError::UpstreamFailure(e.to_string()));
                    continue;
                }
            };

            let permit = self.semaphore_for(&model.model_id, config.gateway.per_model_concurrency);
            let _permit = match permit.acquire().await {
                Ok(p) => p,
                Err(_) => continue,
            };

            let call = client.generate(enriched, &model);
            let outcome = match tokio::time::timeout(deadline, call).await {
                Ok(inner) => inner,
                Err(_) => {
                    self.circuit.record_failure(&model.model_id, &AdapterError::Transient("deadline exceeded".into()));
                    last_err = Some(GatewayError::Timeout { deadline_ms: deadline.as_millis() as u64 });
                    continue;
                }
            };

            match outcome {
                Ok(result) => return Ok((model, result)),
                Err(AdapterError::ClientInvalid(msg)) => {
                    return Err(GatewayError::InvalidRequest(msg));
                }
                Err(err) => {
                    self.circuit.record_failure(&model.model_id, &err);
                    last_err = Some(GatewayError::UpstreamFailure(err.to_string()));

                    let retryable = matches!(err, AdapterError::Transient(_) | AdapterError::RateLimited(_));
                    let is_last_attempt = attempt + 1 == attempt_order.len();
                    if !retryable && !is_last_attempt {
                        // Auth/Fatal errors skip straight to the fallback
                        // attempt rather than trying any remaining
                        // non-fallback candidates.
                        continue;
                    }
                }
            }
        }

        last_err.ok_or_else(|| GatewayError::Internal("no adapter attempt was made".into()))
    }

    async fn backend_for(&self, model: &ModelConfiguration) -> anyhow::Result<Arc<BackendClient>> {
        if let Some(existing) = self.backends.get(&model.model_id) {
            return Ok(Arc::clone(&existing));
        }

        let secret = match model.api_key_ref() {
            Some(secret_ref) => Some(self.secrets.resolve(&secret_ref).await?),
            None => None,
        };
        let client = Arc::new(BackendClient::new(model, secret)?);
        self.backends.insert(model.model_id.clone(), Arc::clone(&client));
        Ok(client)
    }

    fn semaphore_for(&self, model_id: &str, permits: usize) -> Arc<Semaphore> {
        Arc::clone(
            &self
                .semaphores
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(permits))),
        )
    }
}

/// At-most-one failover: the chosen model, then one other active candidate,
/// then the fallback model as the final safety net.
fn failover_order<'a>(first_id: &'a str, candidates: &[&'a str]) -> Vec<&'a str> {
    let mut order = vec![first_id];
    if let Some(&next) = candidates.iter().find(|&&c| c != first_id) {
        order.push(next);
    }
    if !order.contains(&"fallback") {
        order.push("fallback");
    }
    order
}

fn success_record(enriched: &EnrichedRequest, response: &Response) -> UsageRecord {
    UsageRecord {
        request_id: enriched.request_id,
        user_id: enriched.user_id.clone(),
        model_id: response.model_id_used.clone(),
        provider: response.provider,
        tokens_used: response.tokens_used,
        cost_estimate: response.cost_estimate,
        latency_ms: response.latency_ms,
        cached: false,
        task_type: enriched.task_type.clone(),
        session_id: enriched.session_id.clone(),
        timestamp: enriched.timestamp,
        error_kind: None,
    }
}

fn cache_hit_record(enriched: &EnrichedRequest, response: &Response) -> UsageRecord {
    UsageRecord {
        request_id: enriched.request_id,
        user_id: enriched.user_id.clone(),
        model_id: response.model_id_used.clone(),
        provider: response.provider,
        tokens_used: 0,
        cost_estimate: Decimal::ZERO,
        latency_ms: response.latency_ms,
        cached: true,
        task_type: enriched.task_type.clone(),
        session_id: enriched.session_id.clone(),
        timestamp: enriched.timestamp,
        error_kind: None,
    }
}

fn error_record(enriched: &EnrichedRequest, kind: &str) -> UsageRecord {
    UsageRecord {
        request_id: enriched.request_id,
        user_id: enriched.user_id.clone(),
        model_id: String::new(),
        provider: crate::models::Provider::Fallback,
        tokens_used: 0,
        cost_estimate: Decimal::ZERO,
        latency_ms: 0,
        cached: false,
        task_type: enriched.task_type.clone(),
        session_id: enriched.session_id.clone(),
        timestamp: enriched.timestamp,
        error_kind: Some(kind.to_string()),
    }
}
