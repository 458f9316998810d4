//! In-memory traffic log exposed through the introspection API.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume. Cumulative metrics live elsewhere
//! (see [`crate::node::NodeRegistry`] / `api::metrics`) — this log backs
//! recent-activity views only, not `/metrics`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push] uses
/// a non-blocking `try_lock` so it never delays request handling; in the
/// unlikely event of lock contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    /// Create a new log with the given capacity.
    ///
    /// `capacity` is the maximum number of entries retained. Older entries are
    /// silently dropped once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed request.
    ///
    /// This is a best-effort, non-blocking operation: if the mutex is contended
    /// the entry is dropped rather than blocking the request path.
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Compute aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();

        let mut node_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for entry in entries.iter() {
            *node_counts.entry(entry.node.clone()).or_default() += 1;
        }

        TrafficStats {
            total_requests: total,
            error_count,
            avg_latency_ms,
            node_counts,
        }
    }
}

/// A single dispatched-request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// Unique request ID.
    pub id: String,
    /// Timestamp of the request.
    pub timestamp: DateTime<Utc>,
    /// Model identifier as given by the client, if any.
    pub requested_model: Option<String>,
    /// Node that handled this request.
    pub node: String,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Whether the upstream call completed (any status code counts as
    /// success here — only transport failures/timeouts count as failed).
    pub success: bool,
    /// Error description when `success` is `false`.
    pub error: Option<String>,
}

impl TrafficEntry {
    pub fn new(node: String, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            requested_model: None,
            node,
            latency_ms,
            success,
            error: None,
        }
    }

    /// Attach the original model hint from the request.
    pub fn with_requested_model(mut self, model: &str) -> Self {
        self.requested_model = Some(model.to_string());
        self
    }

    /// Attach an error description for failed requests.
    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    /// Number of requests that returned an error.
    pub error_count: usize,
    pub avg_latency_ms: f64,
    pub node_counts: std::collections::HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(node: &str, latency_ms: u64) -> TrafficEntry {
        TrafficEntry::new(node.into(), latency_ms, true)
    }

    #[tokio::test]
    async fn push_and_retrieve_single_entry() {
        let log = TrafficLog::new(10);
        log.push(make_entry("gpu-1", 42));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].node, "gpu-1");
        assert_eq!(recent[0].latency_ms, 42);
    }

    #[tokio::test]
    async fn recent_returns_entries_newest_first() {
        let log = TrafficLog::new(10);
        log.push(make_entry("gpu-1", 1));
        log.push(make_entry("gpu-2", 2));
        log.push(make_entry("cloud", 3));

        let recent = log.recent(10).await;
        assert_eq!(recent[0].node, "cloud");
        assert_eq!(recent[1].node, "gpu-2");
        assert_eq!(recent[2].node, "gpu-1");
    }

    #[tokio::test]
    async fn recent_limits_result_count() {
        let log = TrafficLog::new(20);
        for i in 0..10u64 {
            log.push(make_entry("gpu-1", i));
        }
        let recent = log.recent(3).await;
        assert_eq!(recent.len(), 3);
    }

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = TrafficLog::new(3);
        log.push(make_entry("oldest", 1));
        log.push(make_entry("middle", 2));
        log.push(make_entry("newest", 3));
        log.push(make_entry("extra", 4));

        let all = log.recent(100).await;
        assert_eq!(all.len(), 3);
        assert!(!all.iter().any(|e| e.node == "oldest"));
        assert!(all.iter().any(|e| e.node == "extra"));
    }

    #[tokio::test]
    async fn stats_on_empty_log() {
        let log = TrafficLog::new(10);
        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_latency_ms, 0.0);
        assert!(stats.node_counts.is_empty());
    }

    #[tokio::test]
    async fn stats_averages_latency_correctly() {
        let log = TrafficLog::new(10);
        log.push(make_entry("gpu-1", 100));
        log.push(make_entry("gpu-1", 200));
        log.push(make_entry("cloud", 300));

        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert!((stats.avg_latency_ms - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_counts_requests_per_node() {
        let log = TrafficLog::new(10);
        log.push(make_entry("gpu-1", 10));
        log.push(make_entry("gpu-1", 20));
        log.push(make_entry("cloud", 30));

        let stats = log.stats().await;
        assert_eq!(stats.node_counts["gpu-1"], 2);
        assert_eq!(stats.node_counts["cloud"], 1);
    }

    #[test]
    fn entry_has_unique_ids() {
        let a = make_entry("gpu-1", 1);
        let b = make_entry("gpu-1", 1);
        assert_ne!(a.id, b.id, "every entry must have a unique UUID");
    }

    #[test]
    fn entry_records_success_flag() {
        let ok = TrafficEntry::new("gpu-1".into(), 0, true);
        let err = TrafficEntry::new("gpu-1".into(), 0, false);
        assert!(ok.success);
        assert!(!err.success);
    }
}
