//! Pooled HTTP client for forwarding proxied requests to runners

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub forwarded: AtomicU64,
    pub failed: AtomicU64,
}

impl PoolStats {
    pub fn record_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per runner
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send `req` to the absolute `target` URI, keeping method, headers and body.
    ///
    /// The Host header is rewritten to the target's authority.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        target: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let backend_req = build_forward_request(req, target)?;

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };
        self.stats.record_forward();

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn build_forward_request<B>(req: Request<B>, target: &str) -> Result<Request<B>, PoolError> {
    let uri = target
        .parse::<hyper::Uri>()
        .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .ok_or_else(|| PoolError::RequestBuild(format!("target has no authority: {}", target)))?;

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(uri);
    for (key, value) in parts.headers.iter() {
        if key != hyper::header::HOST {
            builder = builder.header(key, value);
        }
    }
    builder
        .header(hyper::header::HOST, authority)
        .body(body)
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        stats.record_forward();
        stats.record_forward();
        stats.record_failure();
        assert_eq!(stats.get_forwarded(), 2);
        assert_eq!(stats.get_failed(), 1);
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.stats().get_forwarded(), 0);
    }

    #[test]
    fn test_forward_request_rewrites_uri_and_host() {
        let req = Request::builder()
            .method("PUT")
            .uri("/shop/cart?x=%20")
            .header("host", "gateway.local")
            .header("x-request-id", "abc")
            .body(())
            .unwrap();

        let forwarded =
            build_forward_request(req, "http://runner-b:9000/shop/cart?x=%20").unwrap();
        assert_eq!(forwarded.method(), "PUT");
        assert_eq!(forwarded.uri().to_string(), "http://runner-b:9000/shop/cart?x=%20");
        assert_eq!(forwarded.headers()["host"], "runner-b:9000");
        assert_eq!(forwarded.headers()["x-request-id"], "abc");
        assert_eq!(forwarded.headers().get_all("host").iter().count(), 1);
    }

    #[test]
    fn test_forward_request_rejects_relative_target() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(matches!(
            build_forward_request(req, "/no-authority"),
            Err(PoolError::RequestBuild(_))
        ));
    }
}
