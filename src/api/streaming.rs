use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::api::{build_upstream_headers, upstream_url_for};
use crate::error::{json_error_response, normalized_upstream_error_response, ProxyError};
use crate::prompt::inject_done_instruction;
use crate::state::AppState;
use crate::stream::{process_stream_with_retries, ClientWriter};

const SESSION_CHANNEL_CAPACITY: usize = 32;

/// Handle a streaming POST: inject the sentinel instruction, issue the
/// initial upstream request and, on 200, hand the response stream to the
/// retry engine on its own task.
pub(crate) async fn handle_streaming_post(
    state: Arc<AppState>,
    path_and_query: &str,
    request_headers: &http::HeaderMap,
    body_bytes: Bytes,
) -> Response {
    let request_seq = state.next_request_seq();
    let span = tracing::info_span!("stream_session", request_seq);
    let session_span = span.clone();
    let handler = async move {
        handle_streaming_post_inner(state, path_and_query, request_headers, body_bytes, session_span)
            .await
    };
    handler.instrument(span).await
}

async fn handle_streaming_post_inner(
    state: Arc<AppState>,
    path_and_query: &str,
    request_headers: &http::HeaderMap,
    body_bytes: Bytes,
    session_span: tracing::Span,
) -> Response {
    let upstream_url = upstream_url_for(&state.config.upstream.base_url, path_and_query);
    tracing::info!(upstream_url = %upstream_url, "new streaming request");

    let mut request_body = match serde_json::from_slice::<Value>(&body_bytes) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return json_error_response(400, "Invalid JSON in request body", None);
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to parse request body");
            return json_error_response(
                400,
                "Invalid JSON in request body",
                Some(Value::String(err.to_string())),
            );
        }
    };

    inject_done_instruction(&mut request_body);

    let upstream_body = match serde_json::to_vec(&request_body) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize modified request body");
            return json_error_response(500, "Internal server error", None);
        }
    };

    let upstream_headers = build_upstream_headers(request_headers);

    let initial_response = match state
        .transport
        .send_stream(
            &upstream_url,
            http::Method::POST,
            &upstream_headers,
            upstream_body,
        )
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "initial upstream request failed");
            return json_error_response(
                502,
                "Bad Gateway",
                Some(Value::String("Failed to connect to upstream server".to_string())),
            );
        }
    };

    let status = initial_response.status();
    tracing::info!(status = status.as_u16(), "initial response received");

    if status != http::StatusCode::OK {
        let body = initial_response.bytes().await.unwrap_or_default();
        return normalized_upstream_error_response(status, &body);
    }

    let (tx, rx) = mpsc::channel::<Bytes>(SESSION_CHANNEL_CAPACITY);
    let session_state = Arc::clone(&state);
    tokio::spawn(
        async move {
            let writer = ClientWriter::new(tx);
            let result = process_stream_with_retries(
                &session_state.config.retry,
                &session_state.transport,
                &session_state.metrics,
                &writer,
                initial_response,
                &request_body,
                &upstream_url,
                &upstream_headers,
            )
            .await;

            match result {
                Ok(()) => session_state.metrics.record_session_completed(),
                Err(ProxyError::ClientDisconnected) => {
                    tracing::debug!("client disconnected; session terminated");
                    session_state.metrics.record_session_failed();
                }
                Err(err) => {
                    tracing::error!(error = %err, "stream session failed");
                    session_state.metrics.record_session_failed();
                }
            }
        }
        .instrument(session_span),
    );

    sse_response(rx)
}

/// Assemble the client-facing SSE response backed by the session channel.
fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let body_stream = futures_util::stream::unfold(rx, |mut rx| async move {
        let chunk = rx.recv().await?;
        Some((Ok::<_, std::convert::Infallible>(chunk), rx))
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        http::HeaderValue::from_static("*"),
    );
    response
}
