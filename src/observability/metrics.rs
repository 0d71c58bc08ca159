use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

/// In-process counters for the proxy.
///
/// Owned by `AppState`; all methods are callable from any task.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    total_requests: AtomicU64,
    streaming_requests: AtomicU64,
    non_streaming_requests: AtomicU64,
    completed_sessions: AtomicU64,
    failed_sessions: AtomicU64,
    total_retries: AtomicU64,
    max_accumulated_text_bytes: AtomicU64,
    interruptions_by_reason: RwLock<FxHashMap<&'static str, u64>>,
}

/// A point-in-time snapshot of [`ProxyMetrics`], serialized on the health
/// endpoint.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub streaming_requests: u64,
    pub non_streaming_requests: u64,
    pub completed_sessions: u64,
    pub failed_sessions: u64,
    pub total_retries: u64,
    pub max_accumulated_text_bytes: u64,
    pub interruptions_by_reason: FxHashMap<&'static str, u64>,
}

impl ProxyMetrics {
    pub fn record_request(&self, streaming: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if streaming {
            self.streaming_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.non_streaming_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_session_completed(&self) {
        self.completed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_failed(&self) {
        self.failed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interruption(&self, reason: &'static str) {
        *self
            .interruptions_by_reason
            .write()
            .entry(reason)
            .or_insert(0) += 1;
    }

    pub fn record_accumulated_text_bytes(&self, bytes: u64) {
        self.max_accumulated_text_bytes
            .fetch_max(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            streaming_requests: self.streaming_requests.load(Ordering::Relaxed),
            non_streaming_requests: self.non_streaming_requests.load(Ordering::Relaxed),
            completed_sessions: self.completed_sessions.load(Ordering::Relaxed),
            failed_sessions: self.failed_sessions.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            max_accumulated_text_bytes: self.max_accumulated_text_bytes.load(Ordering::Relaxed),
            interruptions_by_reason: self.interruptions_by_reason.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_counters() {
        let metrics = ProxyMetrics::default();
        metrics.record_request(true);
        metrics.record_request(true);
        metrics.record_request(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.streaming_requests, 2);
        assert_eq!(snapshot.non_streaming_requests, 1);
    }

    #[test]
    fn test_interruption_counts_by_reason() {
        let metrics = ProxyMetrics::default();
        metrics.record_interruption("DROP");
        metrics.record_interruption("DROP");
        metrics.record_interruption("BLOCK");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.interruptions_by_reason.get("DROP"), Some(&2));
        assert_eq!(snapshot.interruptions_by_reason.get("BLOCK"), Some(&1));
    }

    #[test]
    fn test_max_accumulated_text_keeps_peak() {
        let metrics = ProxyMetrics::default();
        metrics.record_accumulated_text_bytes(10);
        metrics.record_accumulated_text_bytes(500);
        metrics.record_accumulated_text_bytes(42);
        assert_eq!(metrics.snapshot().max_accumulated_text_bytes, 500);
    }
}
