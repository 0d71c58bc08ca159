use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::ServerConfig;
use crate::error::ProxyError;

static RUSTLS_PROVIDER_INIT: Once = Once::new();
const PARSED_URL_CACHE_MAX_ENTRIES: usize = 512;

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
) -> Result<reqwest::Client, ProxyError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .timeout(timeout)
        .build()
        .map_err(|err| ProxyError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// HTTP transport client for sending requests to the upstream API.
///
/// Issues exactly one attempt per call; mid-stream continuation pacing is
/// owned by the retry engine.
pub struct HttpTransport {
    client: OnceLock<Arc<reqwest::Client>>,
    parsed_url_cache: RwLock<FxHashMap<String, Arc<url::Url>>>,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a new transport with connection pooling and timeouts from the given server config.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        RUSTLS_PROVIDER_INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });

        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };

        Self {
            client: OnceLock::new(),
            parsed_url_cache: RwLock::new(FxHashMap::default()),
            pool_max_idle_per_host: config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            timeout: Duration::from_secs(config.timeout),
        }
    }

    fn build_base_client(&self) -> Arc<reqwest::Client> {
        match build_reqwest_client(
            self.pool_max_idle_per_host,
            self.pool_idle_timeout,
            self.timeout,
        ) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                tracing::error!(error = %err, "failed to build configured reqwest client, falling back to default client");
                Arc::new(reqwest::Client::new())
            }
        }
    }

    fn base_client(&self) -> Arc<reqwest::Client> {
        if let Some(existing) = self.client.get() {
            return existing.clone();
        }

        let built = self.build_base_client();
        let _ = self.client.set(built.clone());
        self.client.get().cloned().unwrap_or(built)
    }

    fn parsed_url(&self, url: &str) -> Result<Arc<url::Url>, ProxyError> {
        if let Some(cached) = self.parsed_url_cache.read().get(url) {
            return Ok(cached.clone());
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| ProxyError::Transport(format!("Invalid upstream URL: {e}")))?;

        let mut cache = self.parsed_url_cache.write();
        if let Some(existing) = cache.get(url) {
            return Ok(existing.clone());
        }
        if cache.len() >= PARSED_URL_CACHE_MAX_ENTRIES {
            cache.clear();
        }
        let parsed = Arc::new(parsed);
        cache.insert(url.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// Send a request to the upstream, returning the response as-is.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] when URL parsing or request
    /// execution fails.
    pub async fn send_request(
        &self,
        url: &str,
        method: http::Method,
        headers: &http::HeaderMap,
        body: Option<bytes::Bytes>,
    ) -> Result<reqwest::Response, ProxyError> {
        let parsed_url = self.parsed_url(url)?;
        let client = self.base_client();

        let mut request = reqwest::Request::new(method, parsed_url.as_ref().clone());
        *request.headers_mut() = headers.clone();
        if let Some(body) = body {
            *request.body_mut() = Some(reqwest::Body::from(body));
        }

        client
            .execute(request)
            .await
            .map_err(|err| ProxyError::Transport(err.to_string()))
    }

    /// Send a streaming request to the upstream, returning the response for
    /// stream reading.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] when URL parsing or request
    /// execution fails.
    pub async fn send_stream(
        &self,
        url: &str,
        method: http::Method,
        headers: &http::HeaderMap,
        body: bytes::Bytes,
    ) -> Result<reqwest::Response, ProxyError> {
        // Same as send_request; the caller reads the response body as a stream.
        self.send_request(url, method, headers, Some(body)).await
    }
}
