use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::AppConfig;
use crate::observability::ProxyMetrics;
use crate::transport::HttpTransport;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    pub metrics: ProxyMetrics,
    request_seq: AtomicU64,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, transport: HttpTransport) -> Self {
        Self {
            config,
            transport,
            metrics: ProxyMetrics::default(),
            request_seq: AtomicU64::new(1),
        }
    }

    /// Next per-process request sequence number, used for log correlation.
    pub fn next_request_seq(&self) -> u64 {
        self.request_seq.fetch_add(1, Ordering::Relaxed)
    }
}
