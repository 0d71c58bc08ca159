pub(crate) mod health;
pub(crate) mod passthrough;
pub(crate) mod streaming;

use axum::response::Response;
use http::header::{HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::HeaderMap;

static X_GOOG_API_KEY: HeaderName = HeaderName::from_static("x-goog-api-key");

/// Build the header set forwarded to the upstream.
///
/// Exactly `Authorization`, `X-Goog-Api-Key`, `Content-Type` and `Accept`
/// are carried over; everything else is dropped. Credentials are forwarded
/// verbatim, never inspected.
#[must_use]
pub(crate) fn build_upstream_headers(request_headers: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in [&AUTHORIZATION, &X_GOOG_API_KEY, &CONTENT_TYPE, &ACCEPT] {
        for value in request_headers.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Response for a CORS preflight request.
#[must_use]
pub(crate) fn preflight_response() -> Response {
    let mut response = Response::new(axum::body::Body::empty());
    let headers = response.headers_mut();
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        http::HeaderValue::from_static("*"),
    );
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_METHODS,
        http::HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_HEADERS,
        http::HeaderValue::from_static("Content-Type, Authorization, X-Goog-Api-Key"),
    );
    response
}

/// Join the upstream base URL with the client's path and query.
#[must_use]
pub(crate) fn upstream_url_for(base_url: &str, path_and_query: &str) -> String {
    let base = base_url.trim_end_matches('/');
    format!("{base}{path_and_query}")
}
