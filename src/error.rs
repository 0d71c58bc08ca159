use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

/// Canonical error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Client disconnected")]
    ClientDisconnected,
    #[error("Retry limit ({0}) exceeded")]
    RetryLimitExceeded(u32),
    #[error("Non-retryable upstream status {0} during retry")]
    FatalRetryStatus(u16),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Map an HTTP status code to the Google API status string used in error
/// payloads.
#[must_use]
pub fn google_status_for_code(code: u16) -> &'static str {
    match code {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        500 => "INTERNAL",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

/// Build the standard JSON error body: `{"error":{code,message,status,details?}}`.
#[must_use]
pub fn error_payload(code: u16, message: &str, details: Option<Value>) -> Value {
    let mut error = serde_json::Map::new();
    error.insert("code".to_string(), json!(code));
    error.insert("message".to_string(), json!(message));
    error.insert(
        "status".to_string(),
        json!(google_status_for_code(code)),
    );
    if let Some(details) = details {
        error.insert("details".to_string(), details);
    }
    json!({ "error": error })
}

/// Build a JSON error response with CORS headers, mirroring the upstream
/// API's error envelope.
#[must_use]
pub fn json_error_response(code: u16, message: &str, details: Option<Value>) -> Response {
    let status =
        http::StatusCode::from_u16(code).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
    let body = error_payload(code, message, details);
    json_response_with_status(status, &body)
}

/// Normalise a non-200 upstream response body into a client-facing JSON
/// response, preserving the upstream status code.
///
/// If the body parses as a JSON error envelope, a missing `error.status` is
/// synthesized from `error.code`; otherwise a standard error body wraps the
/// raw upstream text.
#[must_use]
pub fn normalized_upstream_error_response(status: http::StatusCode, body: &[u8]) -> Response {
    if let Ok(mut parsed) = serde_json::from_slice::<Value>(body) {
        if let Some(error) = parsed.get_mut("error").and_then(Value::as_object_mut) {
            if !error.contains_key("status") {
                let code = error
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|code| u16::try_from(code).ok())
                    .unwrap_or(status.as_u16());
                error.insert("status".to_string(), json!(google_status_for_code(code)));
            }
            return json_response_with_status(status, &parsed);
        }
        if parsed.is_object() {
            return json_response_with_status(status, &parsed);
        }
    }

    let message = if status == http::StatusCode::TOO_MANY_REQUESTS {
        "Resource has been exhausted (e.g. check quota)."
    } else {
        "Request failed"
    };
    let details = String::from_utf8_lossy(body);
    let body = error_payload(
        status.as_u16(),
        message,
        Some(json!(details.as_ref())),
    );
    json_response_with_status(status, &body)
}

fn json_response_with_status(status: http::StatusCode, body: &Value) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(axum::body::Body::from(bytes));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json; charset=utf-8"),
    );
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        http::HeaderValue::from_static("*"),
    );
    response
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::InvalidRequest(message) => json_error_response(400, &message, None),
            ProxyError::Transport(message) => json_error_response(502, "Bad Gateway", Some(json!(message))),
            _ => json_error_response(500, "Internal server error", None),
        }
    }
}
