//! Fingerprint-keyed response cache with TTL expiry and single-flight
//! coalescing of concurrent misses.
//!
//! Grounded on the teacher's `DashMap`-per-key idiom (`RateLimiter`'s
//! `DashMap<IpAddr, Bucket>`), generalized to a content-addressed cache with
//! its own eviction and in-flight coordination.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use crate::models::{Request, Response};

/// Deterministic content address for a request. Intentionally excludes
/// `user_id` — the cache is shared across users for identical prompts.
pub fn fingerprint(request: &Request) -> String {
    let normalized_prompt = request.prompt.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized_prompt.as_bytes());
    hasher.update(b"\0");
    hasher.update(request.task_type.as_bytes());
    hasher.update(b"\0");
    hasher.update(request.max_tokens.unwrap_or(0).to_le_bytes());
    hasher.update(b"\0");
    hasher.update(request.temperature.unwrap_or(0.0).to_le_bytes());
    hasher.update(b"\0");
    hasher.update([request.stream as u8]);
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    response: Response,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// In-flight marker for single-flight coalescing: the first caller to miss
/// the cache for a fingerprint holds this mutex while it calls upstream;
/// concurrent callers for the same fingerprint await it and then re-check
/// the cache.
type InFlight = Arc<AsyncMutex<()>>;

/// Content-addressed response cache.
///
/// `get`/`set` never block on the network. Single-flight coordination is
/// driven by the caller via [`Cache::single_flight`]: it hands back a guard
/// that keeps concurrent identical misses from all calling the upstream
/// adapter.
pub struct Cache {
    entries: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, InFlight>,
    insertion_order: AsyncMutex<VecDeque<String>>,
    default_ttl: Duration,
    max_entries: usize,
}

/// Guard returned by [`Cache::single_flight`]. The first caller for a given
/// fingerprint gets `is_leader() == true` and is responsible for calling the
/// upstream adapter and then `set`ting the result; others block on
/// acquisition and should re-check the cache afterward.
pub struct SingleFlightGuard {
    _permit: tokio::sync::OwnedMutexGuard<()>,
    is_leader: bool,
}

impl SingleFlightGuard {
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

impl Cache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            insertion_order: AsyncMutex::new(VecDeque::new()),
            default_ttl,
            max_entries,
        }
    }

    /// Look up a cached, non-expired response.
    pub fn get(&self, fp: &str) -> Option<Response> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(fp) {
            if !entry.is_expired(now) {
                return Some(entry.response.clone());
            }
        }
        None
    }

    /// Insert a response. No-ops for zero-cost fallback responses (nothing
    /// useful to cache — they are already free) and for entries marked
    /// non-cacheable by the caller.
    pub async fn set(&self, fp: &str, response: Response) {
        if response.tokens_used == 0 || response.cached {
            return;
        }

        self.evict_if_full().await;

        self.entries.insert(
            fp.to_string(),
            CacheEntry { response, inserted_at: Instant::now(), ttl: self.default_ttl },
        );
        let mut order = self.insertion_order.lock().await;
        order.push_back(fp.to_string());
    }

    async fn evict_if_full(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let mut order = self.insertion_order.lock().await;
        while self.entries.len() >= self.max_entries {
            let Some(oldest) = order.pop_front() else { break };
            self.entries.remove(&oldest);
        }
    }

    /// Acquire single-flight coordination for a fingerprint. The caller that
    /// becomes leader should perform the upstream call and `set` the result;
    /// non-leaders should re-check [`Cache::get`] once the guard resolves.
    pub async fn single_flight(&self, fp: &str) -> SingleFlightGuard {
        // Leadership is decided atomically by the DashMap entry API: the
        // caller that inserts the lock is the leader, everyone else finds it
        // already occupied. The lock itself is uncontended for the leader
        // and makes followers wait until the leader drops its guard.
        let (lock, is_leader) = match self.in_flight.entry(fp.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let lock: InFlight = Arc::new(AsyncMutex::new(()));
                e.insert(lock.clone());
                (lock, true)
            }
        };

        let permit = lock.lock_owned().await;
        SingleFlightGuard { _permit: permit, is_leader }
    }

    /// Release the in-flight entry once the leader has finished populating
    /// the cache, so the next genuine miss doesn't wait on a stale lock.
    pub fn release_single_flight(&self, fp: &str) {
        self.in_flight.remove(fp);
    }
}
