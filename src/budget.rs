//! Per-user and global budget accounting.
//!
//! Grounded on `usage_tracking.py`'s `check_user_limits`/`track_usage` pair
//! (strict less-than comparison, a `limits_exceeded` list of failing
//! dimensions) reimplemented with the teacher's per-key `DashMap` mutual
//! exclusion idiom so `check` and the paired `record` are atomic per user
//! without a global lock.
//!
//! `check` hands back the locked [`UserSlot`] rather than dropping the lock
//! before returning: the caller (the gateway facade) keeps it alive across
//! routing and the adapter call, and only drops it after `record` (or
//! immediately, on rejection). That holds one continuous per-user critical
//! section across the whole admission-to-accounting span, so two concurrent
//! requests for the same user straddling a window boundary can't both read
//! the same pre-increment counters and both get admitted.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::config::{BudgetEnforcement, TierLimits};
use crate::models::UserTier;

#[derive(Debug, Clone)]
struct BudgetAccount {
    tier: UserTier,
    daily_requests: u32,
    weekly_requests: u32,
    monthly_requests: u32,
    current_month_usage: Decimal,
    last_reset: DateTime<Utc>,
}

impl BudgetAccount {
    fn new(tier: UserTier, now: DateTime<Utc>) -> Self {
        Self {
            tier,
            daily_requests: 0,
            weekly_requests: 0,
            monthly_requests: 0,
            current_month_usage: Decimal::ZERO,
            last_reset: now,
        }
    }

    fn roll_windows(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.last_reset.date_naive() {
            self.daily_requests = 0;
        }
        if now.iso_week() != self.last_reset.iso_week() {
            self.weekly_requests = 0;
        }
        if now.year() != self.last_reset.year() || now.month() != self.last_reset.month() {
            self.monthly_requests = 0;
            self.current_month_usage = Decimal::ZERO;
        }
        self.last_reset = now;
    }
}

/// Result of a budget admission check.
#[derive(Debug, Clone)]
pub struct Admission {
    pub allowed: bool,
    pub limits_exceeded: Vec<String>,
}

impl Admission {
    fn allow() -> Self {
        Self { allowed: true, limits_exceeded: vec![] }
    }
}

/// The per-user lock, held live from `check` through `record`. As long as
/// this value stays in scope, no other request for the same user can
/// observe this account, admitted or not — it is the one continuous
/// critical section spanning admission and accounting.
pub struct UserSlot {
    guard: OwnedMutexGuard<BudgetAccount>,
}

struct GlobalState {
    daily_usage: Decimal,
    monthly_usage: Decimal,
    last_reset: DateTime<Utc>,
}

/// Tracks per-user quotas and an optional global monthly/daily cap.
pub struct BudgetManager {
    accounts: DashMap<String, Arc<AsyncMutex<BudgetAccount>>>,
    global: AsyncMutex<GlobalState>,
    enforcement: BudgetEnforcement,
    global_monthly_budget: Option<Decimal>,
    global_daily_budget_fraction: f64,
}

impl BudgetManager {
    pub fn new(
        enforcement: BudgetEnforcement,
        global_monthly_budget: Option<Decimal>,
        global_daily_budget_fraction: f64,
    ) -> Self {
        Self {
            accounts: DashMap::new(),
            global: AsyncMutex::new(GlobalState {
                daily_usage: Decimal::ZERO,
                monthly_usage: Decimal::ZERO,
                last_reset: Utc::now(),
            }),
            enforcement,
            global_monthly_budget,
            global_daily_budget_fraction,
        }
    }

    fn slot_for(&self, user_id: &str, tier: UserTier) -> Arc<AsyncMutex<BudgetAccount>> {
        Arc::clone(
            &self
                .accounts
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(BudgetAccount::new(tier, Utc::now())))),
        )
    }

    /// Admission check against per-user window limits and the global cap.
    /// Returns the still-locked [`UserSlot`]: the caller must keep it alive
    /// across routing and the adapter call and pass it into
    /// [`BudgetManager::record`] (or simply drop it on rejection), so no
    /// interleaved request for the same user can be admitted against
    /// counters this request is about to increment.
    pub async fn check(
        &self,
        user_id: &str,
        tier: UserTier,
        limits: TierLimits,
        is_critical_priority: bool,
    ) -> (Admission, UserSlot) {
        let mutex = self.slot_for(user_id, tier);
        let mut guard = mutex.lock_owned().await;
        guard.roll_windows(Utc::now());

        let mut failing = Vec::new();
        if guard.daily_requests >= limits.daily_limit {
            failing.push("daily".to_string());
        }
        if guard.weekly_requests >= limits.weekly_limit {
            failing.push("weekly".to_string());
        }
        if guard.monthly_requests >= limits.monthly_limit {
            failing.push("monthly".to_string());
        }
        if guard.current_month_usage >= limits.monthly_budget {
            failing.push("budget".to_string());
        }

        if !failing.is_empty() {
            let allowed = self.enforcement == BudgetEnforcement::Soft;
            return (Admission { allowed, limits_exceeded: failing }, UserSlot { guard });
        }

        if !is_critical_priority && self.global_cap_reached().await {
            let allowed = self.enforcement == BudgetEnforcement::Soft;
            return (
                Admission { allowed, limits_exceeded: vec!["global_budget".to_string()] },
                UserSlot { guard },
            );
        }

        (Admission::allow(), UserSlot { guard })
    }

    async fn global_cap_reached(&self) -> bool {
        let Some(monthly_cap) = self.global_monthly_budget else { return false };
        let mut global = self.global.lock().await;
        let now = Utc::now();
        if now.date_naive() != global.last_reset.date_naive() {
            global.daily_usage = Decimal::ZERO;
        }
        if now.year() != global.last_reset.year() || now.month() != global.last_reset.month() {
            global.monthly_usage = Decimal::ZERO;
        }
        global.last_reset = now;

        let days_in_month = Decimal::from(30);
        let daily_slice = monthly_cap / days_in_month;
        let threshold = daily_slice * Decimal::try_from(self.global_daily_budget_fraction).unwrap_or(Decimal::new(9, 1));
        global.daily_usage >= threshold || global.monthly_usage >= monthly_cap
    }

    /// Record actual usage after a successful adapter call. Increments all
    /// three request counters and the monthly cost on the same locked
    /// account `check` admitted — `slot` still holds the guard `check`
    /// returned, so this never re-acquires the per-user lock and no
    /// interleaved `check` can have observed these counters half-updated.
    pub async fn record(&self, slot: &mut UserSlot, cost: Decimal) {
        slot.guard.daily_requests += 1;
        slot.guard.weekly_requests += 1;
        slot.guard.monthly_requests += 1;
        slot.guard.current_month_usage += cost;

        let mut global = self.global.lock().await;
        global.daily_usage += cost;
        global.monthly_usage += cost;
    }

    /// Current month's usage for a user, for introspection endpoints.
    pub async fn current_usage(&self, user_id: &str) -> Option<Decimal> {
        let mutex = self.accounts.get(user_id)?.clone();
        let account = mutex.lock().await;
        Some(account.current_month_usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> TierLimits {
        TierLimits::for_tier(UserTier::Free)
    }

    #[tokio::test]
    async fn admits_fresh_user() {
        let mgr = BudgetManager::new(BudgetEnforcement::Strict, None, 0.9);
        let (admission, _slot) = mgr.check("u1", UserTier::Free, limits(), false).await;
        assert!(admission.allowed);
        assert!(admission.limits_exceeded.is_empty());
    }

    #[tokio::test]
    async fn rejects_when_monthly_budget_exhausted() {
        let mgr = BudgetManager::new(BudgetEnforcement::Strict, None, 0.9);
        let (_, mut slot) = mgr.check("u2", UserTier::Free, limits(), false).await;
        mgr.record(&mut slot, limits().monthly_budget).await;
        drop(slot);

        let (admission, _) = mgr.check("u2", UserTier::Free, limits(), false).await;
        assert!(!admission.allowed);
        assert!(admission.limits_exceeded.contains(&"budget".to_string()));
    }

    #[tokio::test]
    async fn soft_enforcement_allows_but_reports_exceeded() {
        let mgr = BudgetManager::new(BudgetEnforcement::Soft, None, 0.9);
        let (_, mut slot) = mgr.check("u3", UserTier::Free, limits(), false).await;
        mgr.record(&mut slot, limits().monthly_budget).await;
        drop(slot);

        let (admission, _) = mgr.check("u3", UserTier::Free, limits(), false).await;
        assert!(admission.allowed, "soft enforcement must still allow the request");
        assert!(!admission.limits_exceeded.is_empty());
    }

    #[tokio::test]
    async fn daily_limit_rejects_at_exactly_the_boundary() {
        let mgr = BudgetManager::new(BudgetEnforcement::Strict, None, 0.9);
        let tier_limits = TierLimits {
            daily_limit: 2,
            weekly_limit: 1000,
            monthly_limit: 1000,
            monthly_budget: Decimal::new(100_00, 2),
        };
        for _ in 0..2 {
            let (admission, mut slot) = mgr.check("u4", UserTier::Free, tier_limits, false).await;
            assert!(admission.allowed);
            mgr.record(&mut slot, Decimal::ZERO).await;
        }
        let (admission, _) = mgr.check("u4", UserTier::Free, tier_limits, false).await;
        assert!(!admission.allowed, "daily limit reached exactly should reject");
        assert!(admission.limits_exceeded.contains(&"daily".to_string()));
    }

    #[tokio::test]
    async fn concurrent_checks_for_same_user_serialize_cost_accounting() {
        let mgr = Arc::new(BudgetManager::new(BudgetEnforcement::Strict, None, 0.9));
        let tier_limits = TierLimits {
            daily_limit: 1000,
            weekly_limit: 1000,
            monthly_limit: 1000,
            monthly_budget: Decimal::new(1_000_00, 2),
        };
        let mut handles = Vec::new();
        for _ in 0..20 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                let (admission, mut slot) = mgr.check("u5", UserTier::Free, tier_limits, false).await;
                assert!(admission.allowed);
                mgr.record(&mut slot, Decimal::ONE).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let usage = mgr.current_usage("u5").await.unwrap();
        assert_eq!(usage, Decimal::from(20), "every concurrent request's cost must be reflected exactly once");
    }

    #[tokio::test]
    async fn different_users_have_independent_accounts() {
        let mgr = BudgetManager::new(BudgetEnforcement::Strict, None, 0.9);
        let (_, mut slot) = mgr.check("u6", UserTier::Free, limits(), false).await;
        mgr.record(&mut slot, limits().monthly_budget).await;
        drop(slot);

        let (admission, _) = mgr.check("u7", UserTier::Free, limits(), false).await;
        assert!(admission.allowed, "a different user's exhausted budget must not affect this one");
    }

    /// Regression test for the check/record atomicity bug: with the per-user
    /// lock released between `check` and `record`, two concurrent requests
    /// straddling a `daily_limit` of 1 could both read `daily_requests == 0`
    /// and both be admitted. Holding the `UserSlot` guard across the
    /// simulated adapter call (the `sleep`) forces the second `check` to
    /// block until the first has recorded, so it correctly observes the
    /// limit already reached.
    #[tokio::test]
    async fn concurrent_checks_at_daily_boundary_admit_only_one_past_limit() {
        let mgr = Arc::new(BudgetManager::new(BudgetEnforcement::Strict, None, 0.9));
        let tier_limits = TierLimits {
            daily_limit: 1,
            weekly_limit: 1000,
            monthly_limit: 1000,
            monthly_budget: Decimal::new(100_00, 2),
        };

        let first = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                let (admission, mut slot) = mgr.check("u-boundary", UserTier::Free, tier_limits, false).await;
                // Simulate the routing + adapter network call happening
                // while the per-user lock is still held.
                tokio::time::sleep(Duration::from_millis(20)).await;
                if admission.allowed {
                    mgr.record(&mut slot, Decimal::ZERO).await;
                }
                admission.allowed
            })
        };

        // Give `first` a head start so it acquires the lock before `second`
        // attempts to.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                let (admission, mut slot) = mgr.check("u-boundary", UserTier::Free, tier_limits, false).await;
                if admission.allowed {
                    mgr.record(&mut slot, Decimal::ZERO).await;
                }
                admission.allowed
            })
        };

        let (first_allowed, second_allowed) = tokio::join!(first, second);
        let admitted = [first_allowed.unwrap(), second_allowed.unwrap()].into_iter().filter(|&a| a).count();
        assert_eq!(admitted, 1, "only one of two requests racing the same daily boundary may be admitted");
    }
}
