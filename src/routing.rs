//! Pure model selection.
//!
//! Takes a candidate set and request context and picks one model id — no
//! network calls, no locking. Grounded on the teacher's tier/alias resolution
//! in `router.rs::dispatch`, generalized from "ladder of named tiers" to
//! "rule-narrowed candidate set with priority and cost tie-breaks".

use crate::config::{Config, RoutingRule};
use crate::models::{ModelPriority, RequestPriority, UserTier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    NoModelAvailable,
}

/// Select one model id from `candidates`, given the active configuration and
/// request context. `candidates` is expected to already be filtered to
/// active + circuit-admitted model ids by the caller (the facade).
pub fn select<'a>(
    config: &'a Config,
    candidates: &[&'a str],
    task_type: &str,
    tier: UserTier,
    priority: RequestPriority,
) -> Result<&'a str, RoutingError> {
    let mut pool: Vec<&str> = candidates.to_vec();
    if pool.is_empty() {
        return Err(RoutingError::NoModelAvailable);
    }

    for rule in config.get_matching_rules(task_type, tier, priority) {
        pool = apply_rule(&pool, rule);
    }

    if pool.is_empty() {
        return Err(RoutingError::NoModelAvailable);
    }

    // Prefer a High/Critical priority model when the caller asked for
    // elevated priority and one is present in the remaining pool.
    if priority >= RequestPriority::High {
        if let Some(preferred) = highest_priority_preference(config, &pool) {
            return Ok(preferred);
        }
    }

    tie_break(config, &pool).ok_or(RoutingError::NoModelAvailable)
}

/// Narrow/reorder `pool` according to one matching rule: candidates named by
/// the rule are moved to the front, in the rule's declared order; anything
/// the rule doesn't mention but pool still contains stays available after
/// them (rules narrow preference, not eligibility — eligibility already
/// comes from the circuit/active filter upstream).
fn apply_rule<'a>(pool: &[&'a str], rule: &RoutingRule) -> Vec<&'a str> {
    let mut ordered: Vec<&str> = Vec::new();
    for candidate in &rule.candidates {
        if let Some(&m) = pool.iter().find(|m| **m == candidate.as_str()) {
            if !ordered.contains(&m) {
                ordered.push(m);
            }
        }
    }
    for &m in pool {
        if !ordered.contains(&m) {
            ordered.push(m);
        }
    }
    ordered
}

fn highest_priority_preference<'a>(config: &Config, pool: &[&'a str]) -> Option<&'a str> {
    pool.iter()
        .copied()
        .filter(|id| {
            config
                .models
                .get(*id)
                .map(|m| m.priority >= ModelPriority::High)
                .unwrap_or(false)
        })
        .min_by(|a, b| tie_break_key(config, a).cmp(&tie_break_key(config, b)))
}

fn tie_break<'a>(config: &Config, pool: &[&'a str]) -> Option<&'a str> {
    pool.iter().copied().min_by(|a, b| tie_break_key(config, a).cmp(&tie_break_key(config, b)))
}

/// Sort key implementing "ascending cost, then descending priority, then
/// lexical model id" — `Ord` on the tuple naturally compares left-to-right,
/// so priority and model id are pre-negated/as-is to get the right direction.
fn tie_break_key(config: &Config, model_id: &str) -> (rust_decimal::Decimal, std::cmp::Reverse<ModelPriority>, String) {
    let model = config.models.get(model_id);
    let cost = model.map(|m| m.cost_per_token).unwrap_or(rust_decimal::Decimal::MAX);
    let priority = model.map(|m| m.priority).unwrap_or(ModelPriority::Fallback);
    (cost, std::cmp::Reverse(priority), model_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with(toml: &str) -> Config {
        Config::from_toml_str(toml).unwrap()
    }

    #[test]
    fn empty_candidates_is_no_model_available() {
        let config = config_with("[gateway]\n");
        let result = select(&config, &[], "chat", UserTier::Free, RequestPriority::Normal);
        assert_eq!(result, Err(RoutingError::NoModelAvailable));
    }

    #[test]
    fn picks_cheapest_when_no_rules_apply() {
        let config = config_with(
            r#"
            [gateway]
            [models.cheap]
            model_id = "cheap"
            provider = "fallback"
            model_name = "cheap"
            priority = "medium"
            cost_per_token = "0.0001"
            max_tokens = 100

            [models.expensive]
            model_id = "expensive"
            provider = "fallback"
            model_name = "expensive"
            priority = "medium"
            cost_per_token = "0.01"
            max_tokens = 100
            "#,
        );
        let candidates = ["cheap", "expensive"];
        let result = select(&config, &candidates, "chat", UserTier::Free, RequestPriority::Normal);
        assert_eq!(result, Ok("cheap"));
    }

    #[test]
    fn routing_rule_pins_preferred_model() {
        let config = config_with(
            r#"
            [gateway]
            [models.a]
            model_id = "a"
            provider = "fallback"
            model_name = "a"
            priority = "medium"
            cost_per_token = "0.0001"
            max_tokens = 100

            [models.b]
            model_id = "b"
            provider = "fallback"
            model_name = "b"
            priority = "medium"
            cost_per_token = "0.0001"
            max_tokens = 100

            [[routing_rules]]
            task_type = "workout"
            candidates = ["b", "a"]
            "#,
        );
        let candidates = ["a", "b"];
        let result = select(&config, &candidates, "workout", UserTier::Free, RequestPriority::Normal);
        assert_eq!(result, Ok("b"), "rule should prefer b even though a is cheaper");
    }

    #[test]
    fn high_priority_request_prefers_high_priority_model() {
        let config = config_with(
            r#"
            [gateway]
            [models.cheap-low]
            model_id = "cheap-low"
            provider = "fallback"
            model_name = "cheap-low"
            priority = "low"
            cost_per_token = "0.0001"
            max_tokens = 100

            [models.costly-high]
            model_id = "costly-high"
            provider = "fallback"
            model_name = "costly-high"
            priority = "high"
            cost_per_token = "0.01"
            max_tokens = 100
            "#,
        );
        let candidates = ["cheap-low", "costly-high"];
        let result = select(&config, &candidates, "chat", UserTier::Free, RequestPriority::High);
        assert_eq!(result, Ok("costly-high"));
    }

    #[test]
    fn selection_is_deterministic_on_repeated_calls() {
        let config = config_with(
            r#"
            [gateway]
            [models.a]
            model_id = "a"
            provider = "fallback"
            model_name = "a"
            priority = "medium"
            cost_per_token = "0.0001"
            max_tokens = 100
            [models.b]
            model_id = "b"
            provider = "fallback"
            model_name = "b"
            priority = "medium"
            cost_per_token = "0.0001"
            max_tokens = 100
            "#,
        );
        let candidates = ["b", "a"];
        let first = select(&config, &candidates, "chat", UserTier::Free, RequestPriority::Normal);
        let second = select(&config, &candidates, "chat", UserTier::Free, RequestPriority::Normal);
        assert_eq!(first, second);
        assert_eq!(first, Ok("a"), "equal cost/priority should tie-break lexically");
    }
}
