use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;

use crate::api::{build_upstream_headers, upstream_url_for};
use crate::error::{json_error_response, normalized_upstream_error_response};
use crate::state::AppState;

/// Forward a non-streaming request to the upstream verbatim and relay the
/// response.
pub(crate) async fn handle_passthrough(
    state: Arc<AppState>,
    method: http::Method,
    path_and_query: &str,
    request_headers: &http::HeaderMap,
    body_bytes: Option<Bytes>,
) -> Response {
    let upstream_url = upstream_url_for(&state.config.upstream.base_url, path_and_query);
    let upstream_headers = build_upstream_headers(request_headers);

    let body = if method == http::Method::GET || method == http::Method::HEAD {
        None
    } else {
        body_bytes
    };

    let response = match state
        .transport
        .send_request(&upstream_url, method, &upstream_headers, body)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "passthrough upstream request failed");
            return json_error_response(
                502,
                "Bad Gateway",
                Some(serde_json::Value::String(
                    "Failed to connect to upstream server".to_string(),
                )),
            );
        }
    };

    let status = response.status();
    if status != http::StatusCode::OK {
        let body = response.bytes().await.unwrap_or_default();
        return normalized_upstream_error_response(status, &body);
    }

    relay_response(response)
}

fn relay_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &upstream_headers {
        // Hop-by-hop headers are owned by each connection.
        if name == http::header::CONNECTION || name == http::header::TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        http::HeaderValue::from_static("*"),
    );
    response
}
