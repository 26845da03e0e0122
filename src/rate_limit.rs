//! Sliding-window rate limiter keyed by `(route_class, principal)`.
//!
//! Each key gets its own `DashMap` entry holding an explicit window of
//! timestamps, so the admission boundary matches "N requests per window"
//! exactly rather than approximating it with token refill.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use dashmap::DashMap;

/// Key identifying one rate-limit bucket: a route class (e.g. `"completion"`)
/// paired with the requesting principal (authenticated user id, or client
/// address when unauthenticated).
pub type RateLimitKey = (String, String);

struct Window {
    timestamps: VecDeque<Instant>,
}

/// In-memory, per-instance sliding-window limiter.
///
/// Consistency across instances is explicitly best-effort — this is process-
/// local state, matching the gateway's documented non-goal of a distributed
/// rate limit store.
pub struct RateLimiter {
    windows: DashMap<RateLimitKey, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { windows: DashMap::new() }
    }

    /// Admit or reject a request for `key`, given `limit` requests per
    /// `window`. Expired timestamps are pruned on every call so memory use
    /// stays bounded by active keys, not historical request volume.
    pub fn check(&self, key: &RateLimitKey, limit: u32, window: Duration) -> bool {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| Window { timestamps: VecDeque::new() });

        while let Some(&oldest) = entry.timestamps.front() {
            if now.duration_since(oldest) > window {
                entry.timestamps.pop_front();
            } else {
                break;
            }
        }

        if entry.timestamps.len() as u32 >= limit {
            return false;
        }

        entry.timestamps.push_back(now);
        true
    }

    /// Requests remaining in the current window for `key`, without
    /// consuming one. Used by introspection endpoints.
    pub fn remaining(&self, key: &RateLimitKey, limit: u32, window: Duration) -> u32 {
        let now = Instant::now();
        match self.windows.get(key) {
            None => limit,
            Some(entry) => {
                let active = entry.timestamps.iter().filter(|&&t| now.duration_since(t) <= window).count() as u32;
                limit.saturating_sub(active)
            }
        }
    }

    /// Seconds until the oldest timestamp in the window expires, for
    /// `Retry-After` headers. Returns 0 if the window is not currently full.
    pub fn retry_after_secs(&self, key: &RateLimitKey, limit: u32, window: Duration) -> u64 {
        let now = Instant::now();
        let Some(entry) = self.windows.get(key) else { return 0 };
        if (entry.timestamps.len() as u32) < limit {
            return 0;
        }
        match entry.timestamps.front() {
            Some(&oldest) => {
                let elapsed = now.duration_since(oldest);
                window.saturating_sub(elapsed).as_secs().max(1)
            }
            None => 0,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
