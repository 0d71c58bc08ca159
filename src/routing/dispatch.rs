use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Method, Request};
use axum::response::Response;

use crate::api::{health, passthrough, preflight_response, streaming};
use crate::error::json_error_response;
use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

enum RouteMatch {
    Preflight,
    Health,
    Streaming,
    Passthrough,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str)
        .to_string();

    let response = match match_route(&parts.method, &parts.uri) {
        RouteMatch::Preflight => preflight_response(),
        RouteMatch::Health => health::health_handler(&state),
        RouteMatch::Streaming => {
            state.metrics.record_request(true);
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            streaming::handle_streaming_post(state, &path_and_query, &parts.headers, body_bytes)
                .await
        }
        RouteMatch::Passthrough => {
            state.metrics.record_request(false);
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            passthrough::handle_passthrough(
                state,
                parts.method,
                &path_and_query,
                &parts.headers,
                Some(body_bytes),
            )
            .await
        }
    };

    Ok(response)
}

fn match_route(method: &Method, uri: &http::Uri) -> RouteMatch {
    if method == Method::OPTIONS {
        return RouteMatch::Preflight;
    }
    if method == Method::GET && matches!(uri.path(), "/health" | "/healthz") {
        return RouteMatch::Health;
    }
    if is_streaming_request(method, uri) {
        return RouteMatch::Streaming;
    }
    RouteMatch::Passthrough
}

/// A request is streaming iff it is a `POST` and its path mentions
/// `stream` or `sse` (case-insensitive), or carries `alt=sse` in the query.
fn is_streaming_request(method: &Method, uri: &http::Uri) -> bool {
    if method != Method::POST {
        return false;
    }

    let path = uri.path().to_ascii_lowercase();
    if path.contains("stream") || path.contains("sse") {
        return true;
    }

    uri.query().is_some_and(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .any(|(key, value)| key == "alt" && value == "sse")
    })
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| json_error_response(413, "Request body too large (max 2MiB)", None))
}
