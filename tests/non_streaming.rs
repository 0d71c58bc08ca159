use std::sync::{Arc, Mutex};

use antiblock_rs::config::AppConfig;
use antiblock_rs::routing::dispatch_request;
use antiblock_rs::state::AppState;
use antiblock_rs::transport::HttpTransport;
use axum::body::Body;
use axum::http::{HeaderMap, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;

fn build_state(base_url: String) -> Arc<AppState> {
    let mut config = AppConfig::default();
    config.upstream.base_url = base_url;
    let transport = HttpTransport::new(&config.server);
    Arc::new(AppState::new(config, transport))
}

async fn spawn_upstream(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn collect_body(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

#[tokio::test]
async fn test_non_streaming_get_is_relayed() {
    let app = Router::new().fallback(|| async {
        Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .header("x-upstream-extra", "kept")
            .body(Body::from(r#"{"models":[{"name":"gemini-2.5-pro"}]}"#))
            .expect("mock response")
    });
    let base_url = spawn_upstream(app).await;
    let state = build_state(base_url);

    let request = Request::builder()
        .method("GET")
        .uri("/v1beta/models")
        .body(Body::empty())
        .expect("request");
    let response = dispatch_request(state, request).await.expect("dispatch");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-upstream-extra")
            .expect("relayed header"),
        "kept"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .expect("cors"),
        "*"
    );
    let payload: Value = serde_json::from_str(&collect_body(response).await).expect("json");
    assert_eq!(payload["models"][0]["name"], "gemini-2.5-pro");
}

#[tokio::test]
async fn test_only_forwardable_headers_reach_upstream() {
    let seen_headers = Arc::new(Mutex::new(HeaderMap::new()));
    let app = Router::new().fallback({
        let seen_headers = Arc::clone(&seen_headers);
        move |request: Request<Body>| {
            let seen_headers = Arc::clone(&seen_headers);
            async move {
                *seen_headers.lock().expect("headers lock") = request.headers().clone();
                Response::builder()
                    .status(200)
                    .body(Body::from("{}"))
                    .expect("mock response")
            }
        }
    });
    let base_url = spawn_upstream(app).await;
    let state = build_state(base_url);

    let request = Request::builder()
        .method("POST")
        .uri("/v1beta/models/gemini-2.5-pro:generateContent")
        .header("content-type", "application/json")
        .header("authorization", "Bearer key")
        .header("x-goog-api-key", "goog-key")
        .header("cookie", "session=abc")
        .header("x-forwarded-for", "10.0.0.1")
        .body(Body::from("{}"))
        .expect("request");
    let response = dispatch_request(state, request).await.expect("dispatch");
    assert_eq!(response.status(), 200);

    let headers = seen_headers.lock().expect("headers lock").clone();
    assert_eq!(headers.get("authorization").expect("auth"), "Bearer key");
    assert_eq!(headers.get("x-goog-api-key").expect("key"), "goog-key");
    assert_eq!(
        headers.get("content-type").expect("content type"),
        "application/json"
    );
    assert!(headers.get("cookie").is_none());
    assert!(headers.get("x-forwarded-for").is_none());
}

#[tokio::test]
async fn test_non_streaming_error_is_normalized() {
    let app = Router::new().fallback(|| async {
        Response::builder()
            .status(404)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"error":{"code":404,"message":"no model"}}"#))
            .expect("mock response")
    });
    let base_url = spawn_upstream(app).await;
    let state = build_state(base_url);

    let request = Request::builder()
        .method("POST")
        .uri("/v1beta/models/unknown:generateContent")
        .body(Body::from("{}"))
        .expect("request");
    let response = dispatch_request(state, request).await.expect("dispatch");

    assert_eq!(response.status(), 404);
    let payload: Value = serde_json::from_str(&collect_body(response).await).expect("json");
    assert_eq!(payload["error"]["status"], "NOT_FOUND");
    assert_eq!(payload["error"]["message"], "no model");
}

#[tokio::test]
async fn test_health_endpoint() {
    let state = build_state("http://127.0.0.1:1".to_string());
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .expect("request");
    let response = dispatch_request(state, request).await.expect("dispatch");

    assert_eq!(response.status(), 200);
    let payload: Value = serde_json::from_str(&collect_body(response).await).expect("json");
    assert_eq!(payload["status"], "healthy");
    assert_eq!(payload["service"], "antiblock-rs");
    assert_eq!(payload["config"]["max_consecutive_retries"], 100);
    assert!(payload["metrics"].is_object());
}

#[tokio::test]
async fn test_healthz_alias() {
    let state = build_state("http://127.0.0.1:1".to_string());
    let request = Request::builder()
        .method("GET")
        .uri("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = dispatch_request(state, request).await.expect("dispatch");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_cors_preflight() {
    let state = build_state("http://127.0.0.1:1".to_string());
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/v1beta/models/gemini-2.5-pro:streamGenerateContent")
        .body(Body::empty())
        .expect("request");
    let response = dispatch_request(state, request).await.expect("dispatch");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .expect("cors"),
        "*"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-headers")
            .expect("headers"),
        "Content-Type, Authorization, X-Goog-Api-Key"
    );
}

#[tokio::test]
async fn test_request_metrics_are_counted() {
    let app = Router::new().fallback(|| async {
        Response::builder()
            .status(200)
            .body(Body::from("{}"))
            .expect("mock response")
    });
    let base_url = spawn_upstream(app).await;
    let state = build_state(base_url);

    let request = Request::builder()
        .method("GET")
        .uri("/v1beta/models")
        .body(Body::empty())
        .expect("request");
    let _ = dispatch_request(Arc::clone(&state), request)
        .await
        .expect("dispatch");

    let snapshot = state.metrics.snapshot();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.non_streaming_requests, 1);
    assert_eq!(snapshot.streaming_requests, 0);
}
