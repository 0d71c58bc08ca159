use std::sync::Arc;

use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::util::unix_now_secs;

/// Health check handler.
/// Returns JSON with status, a config summary and a metrics snapshot.
pub(crate) fn health_handler(state: &Arc<AppState>) -> Response {
    let config = &state.config;
    let metrics = serde_json::to_value(state.metrics.snapshot()).unwrap_or(Value::Null);
    Json(json!({
        "status": "healthy",
        "service": "antiblock-rs",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": unix_now_secs(),
        "config": {
            "upstream_base_url": config.upstream.base_url,
            "max_consecutive_retries": config.retry.max_consecutive_retries,
            "retry_delay_ms": config.retry.retry_delay_ms,
            "swallow_thoughts_after_retry": config.retry.swallow_thoughts_after_retry,
            "log_level": config.features.log_level,
        },
        "metrics": metrics,
    }))
    .into_response()
}
