//! HTTP front door
//!
//! Accepts client connections, answers the gateway's own endpoints and forwards
//! everything else to the runner the router picks.

use crate::api;
use crate::error::{json_error_response, ErrorCode};
use crate::gateway::Gateway;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::telemetry::RequestRecord;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// State shared by every connection
struct Shared {
    gateway: Arc<Gateway>,
    pool: ConnectionPool,
    request_timeout: Duration,
}

pub struct GatewayServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
    pool_config: PoolConfig,
    request_timeout: Duration,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
            pool_config: PoolConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let shared = Arc::new(Shared {
            gateway: Arc::clone(&self.gateway),
            pool: ConnectionPool::new(self.pool_config.clone()),
            request_timeout: self.request_timeout,
        });
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&shared);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, shared).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, shared: Arc<Shared>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // This gateway is the first trusted hop, so client-supplied X-Forwarded-* are replaced
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    if let Some(route) = api::route(req.method(), req.uri().path()) {
        return Ok(api::handle(&shared.gateway, route, req, client_addr).await);
    }

    let router = shared.gateway.router();
    let record = RequestRecord::begin(client_addr.to_string(), req.method().as_str());
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let Some(target) = router.resolve(req.method(), &path_and_query) else {
        let response = json_error_response(
            ErrorCode::UnknownApp,
            "No application or runner serves this path",
        );
        router.complete(None, record, response.status().as_u16());
        return Ok(response);
    };

    let timeout = shared.request_timeout;
    let response = match tokio::time::timeout(timeout, shared.pool.forward(req, &target.uri)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(target = %target.uri, request_id, error = %e, "Failed to forward request");
            json_error_response(ErrorCode::ConnectionFailed, "Failed to connect to runner")
        }
        Err(_) => {
            warn!(
                target = %target.uri,
                request_id,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            )
        }
    };

    router.complete(Some(&target), record, response.status().as_u16());
    Ok(response)
}
