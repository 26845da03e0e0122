//! In-memory usage log exposed through the admin API.
//!
//! [`UsageLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::models::{DecisionReceipt, UsageRecord};

/// Fixed-capacity ring-buffer of recent [`UsageRecord`]s.
///
/// Safe to share across threads via `Arc<UsageLog>`. [`push`][Self::push]
/// uses a non-blocking `try_lock` so it never delays request handling; under
/// contention the record is dropped and `overflow_count` is incremented so
/// the drop is visible rather than silent.
pub struct UsageLog {
    capacity: usize,
    entries: Mutex<VecDeque<UsageRecord>>,
    overflow_count: AtomicU64,
}

impl UsageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            overflow_count: AtomicU64::new(0),
        }
    }

    /// Record a completed request. Best-effort, non-blocking: if the mutex
    /// is contended the record is dropped rather than blocking the request
    /// path, and the overflow counter is incremented.
    pub fn push(&self, record: UsageRecord) {
        match self.entries.try_lock() {
            Ok(mut entries) => {
                if entries.len() == self.capacity {
                    entries.pop_front();
                    self.overflow_count.fetch_add(1, Ordering::Relaxed);
                }
                entries.push_back(record);
            }
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<UsageRecord> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Compute aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> UsageStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| e.error_kind.is_some()).count();
        let cache_hit_count = entries.iter().filter(|e| e.cached).count();

        let mut model_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        let mut total_cost = rust_decimal::Decimal::ZERO;
        for entry in entries.iter() {
            *model_counts.entry(entry.model_id.clone()).or_default() += 1;
            total_cost += entry.cost_estimate;
        }

        UsageStats {
            total_requests: total,
            error_count,
            cache_hit_count,
            avg_latency_ms,
            total_cost_estimate: total_cost,
            model_counts,
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate statistics derived from all buffered [`UsageRecord`]s.
#[derive(Debug, Serialize)]
pub struct UsageStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub cache_hit_count: usize,
    pub avg_latency_ms: f64,
    pub total_cost_estimate: rust_decimal::Decimal,
    pub model_counts: std::collections::HashMap<String, usize>,
    pub overflow_count: u64,
}

/// Optional append-only ring-buffer of [`DecisionReceipt`]s, for auditing
/// which candidates the routing engine rejected and why. Same fixed-capacity,
/// non-blocking shape as [`UsageLog`] — this is an audit convenience, not
/// part of the hot path's correctness.
pub struct DecisionLog {
    capacity: usize,
    entries: Mutex<VecDeque<DecisionReceipt>>,
}

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn push(&self, receipt: DecisionReceipt) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(receipt);
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<DecisionReceipt> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn make_record(model_id: &str, latency_ms: u64) -> UsageRecord {
        UsageRecord {
            request_id: Uuid::new_v4(),
            user_id: "u1".into(),
            model_id: model_id.into(),
            provider: Provider::Fallback,
            tokens_used: 10,
            cost_estimate: Decimal::ZERO,
            latency_ms,
            cached: false,
            task_type: "chat".into(),
            session_id: None,
            timestamp: chrono::Utc::now(),
            error_kind: None,
        }
    }

    #[tokio::test]
    async fn push_and_retrieve_single_entry() {
        let log = UsageLog::new(10);
        log.push(make_record("fallback", 42));
        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].latency_ms, 42);
    }

    #[tokio::test]
    async fn recent_returns_entries_newest_first() {
        let log = UsageLog::new(10);
        log.push(make_record("m1", 1));
        log.push(make_record("m2", 2));
        log.push(make_record("m3", 3));
        let recent = log.recent(10).await;
        assert_eq!(recent[0].model_id, "m3");
        assert_eq!(recent[2].model_id, "m1");
    }

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = UsageLog::new(3);
        log.push(make_record("oldest", 1));
        log.push(make_record("middle", 2));
        log.push(make_record("newest", 3));
        log.push(make_record("extra", 4));

        let all = log.recent(100).await;
        assert_eq!(all.len(), 3);
        assert!(!all.iter().any(|e| e.model_id == "oldest"));
        assert!(all.iter().any(|e| e.model_id == "extra"));
    }

    #[tokio::test]
    async fn overflow_count_increments_on_eviction() {
        let log = UsageLog::new(1);
        log.push(make_record("a", 1));
        log.push(make_record("b", 1));
        let stats = log.stats().await;
        assert_eq!(stats.overflow_count, 1);
    }

    #[tokio::test]
    async fn stats_on_empty_log() {
        let log = UsageLog::new(10);
        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn stats_counts_errors_and_cache_hits() {
        let log = UsageLog::new(10);
        let mut cached = make_record("m1", 1);
        cached.cached = true;
        let mut errored = make_record("m1", 1);
        errored.error_kind = Some("TIMEOUT".into());
        log.push(cached);
        log.push(errored);
        log.push(make_record("m1", 1));

        let stats = log.stats().await;
        assert_eq!(stats.cache_hit_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.total_requests, 3);
    }

    fn make_receipt(selected: Option<&str>) -> DecisionReceipt {
        DecisionReceipt {
            request_id: Uuid::new_v4(),
            selected_model_id: selected.map(String::from),
            rejected: Vec::new(),
            explanation: "test".into(),
        }
    }

    #[tokio::test]
    async fn decision_log_push_and_retrieve() {
        let log = DecisionLog::new(10);
        log.push(make_receipt(Some("gpt-4")));
        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].selected_model_id.as_deref(), Some("gpt-4"));
    }

    #[tokio::test]
    async fn decision_log_evicts_oldest_at_capacity() {
        let log = DecisionLog::new(2);
        log.push(make_receipt(Some("a")));
        log.push(make_receipt(Some("b")));
        log.push(make_receipt(Some("c")));

        let all = log.recent(10).await;
        assert_eq!(all.len(), 2);
        assert!(!all.iter().any(|r| r.selected_model_id.as_deref() == Some("a")));
    }

    #[tokio::test]
    async fn decision_log_recent_respects_limit() {
        let log = DecisionLog::new(10);
        for i in 0..5 {
            log.push(make_receipt(Some(&format!("m{i}"))));
        }
        let recent = log.recent(2).await;
        assert_eq!(recent.len(), 2);
    }
}
