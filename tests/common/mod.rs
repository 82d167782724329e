//! In-process fake runners and a gateway harness for integration tests

#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use runnergate::config::ClusterConfig;
use runnergate::gateway::Gateway;
use runnergate::server::GatewayServer;
use runnergate::telemetry::TelemetrySink;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct FakeState {
    label: String,
    apps: Vec<String>,
    started: bool,
    samples: Vec<Value>,
    create_status: u16,
    create_body: Option<String>,
    create_calls: usize,
    last_forwarded_for: Option<String>,
    delay: Duration,
}

/// A runner that keeps its applications in memory
pub struct FakeRunner {
    pub addr: SocketAddr,
    state: Arc<Mutex<FakeState>>,
    handle: JoinHandle<()>,
}

impl FakeRunner {
    pub async fn start(label: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(FakeState {
            label: label.to_string(),
            apps: Vec::new(),
            started: true,
            samples: Vec::new(),
            create_status: 201,
            create_body: None,
            create_calls: 0,
            last_forwarded_for: None,
            delay: Duration::ZERO,
        }));

        let shared = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(respond(req, state).await) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_apps(&self, names: &[&str]) {
        self.state.lock().apps = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn apps(&self) -> Vec<String> {
        self.state.lock().apps.clone()
    }

    pub fn set_create_response(&self, status: u16, body: &str) {
        let mut state = self.state.lock();
        state.create_status = status;
        state.create_body = Some(body.to_string());
    }

    pub fn set_started(&self, started: bool) {
        self.state.lock().started = started;
    }

    pub fn set_samples(&self, samples: Vec<Value>) {
        self.state.lock().samples = samples;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn last_forwarded_for(&self) -> Option<String> {
        self.state.lock().last_forwarded_for.clone()
    }
}

impl Drop for FakeRunner {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// URL of a port nothing listens on
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

async fn respond(req: Request<Incoming>, state: Arc<Mutex<FakeState>>) -> Response<Full<Bytes>> {
    let delay = state.lock().delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    match (&method, path.as_str()) {
        (&Method::GET, "/api/v1/apps") => {
            let apps: Vec<Value> = state
                .lock()
                .apps
                .iter()
                .map(|name| json!({"name": name, "status": "running"}))
                .collect();
            json(StatusCode::OK, json!({ "apps": apps }))
        }
        (&Method::POST, "/api/v1/apps") => {
            let forwarded_for = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            let name = payload["name"].as_str().unwrap_or_default().to_string();

            let mut state = state.lock();
            state.create_calls += 1;
            state.last_forwarded_for = forwarded_for;
            let status = state.create_status;
            if status == 201 {
                state.apps.push(name.clone());
            }
            let body = state
                .create_body
                .clone()
                .unwrap_or_else(|| json!({"name": name, "runner": state.label}).to_string());
            Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        (&Method::GET, "/api/v1/system") => {
            let state = state.lock();
            json(
                StatusCode::OK,
                json!({
                    "started": state.started,
                    "samples": state.samples,
                    "runner": state.label,
                }),
            )
        }
        (&Method::DELETE, path) if path.starts_with("/api/v1/apps/") => {
            let name = path.trim_start_matches("/api/v1/apps/");
            let mut state = state.lock();
            let before = state.apps.len();
            state.apps.retain(|app| app != name);
            let status = if state.apps.len() < before {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::NOT_FOUND
            };
            Response::builder()
                .status(status)
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
        _ => {
            let label = state.lock().label.clone();
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(Full::new(Bytes::from(format!("{} {} {}", label, method, path_and_query))))
                .unwrap()
        }
    }
}

fn json(status: StatusCode, value: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

pub fn cluster_config(tmp: &TempDir) -> ClusterConfig {
    ClusterConfig {
        state_file: tmp.path().join("cluster.json"),
        refresh_timeout_secs: 2,
        system_timeout_secs: 2,
        aggregate_timeout_secs: 5,
        create_timeout_secs: 5,
    }
}

/// A gateway served on an ephemeral port
pub struct TestGateway {
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway>,
    pub http: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start(config: &ClusterConfig) -> Self {
        Self::start_with_telemetry(config, None).await
    }

    pub async fn start_with_telemetry(
        config: &ClusterConfig,
        telemetry: Option<Arc<dyn TelemetrySink>>,
    ) -> Self {
        let gateway = Arc::new(Gateway::open(config, telemetry).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = GatewayServer::new(addr, Arc::clone(&gateway), shutdown_rx)
            .with_request_timeout(Duration::from_secs(5));
        let handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            addr,
            gateway,
            http: reqwest::Client::new(),
            shutdown_tx,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn register(&self, id: &str, url: &str, max_apps: usize) -> reqwest::Response {
        self.http
            .post(self.url("/api/v1/runners"))
            .json(&json!({"id": id, "url": url, "maxApps": max_apps}))
            .send()
            .await
            .unwrap()
    }

    pub async fn create(&self, name: &str) -> reqwest::Response {
        self.create_at("/api/v1/apps", name).await
    }

    pub async fn create_at(&self, path: &str, name: &str) -> reqwest::Response {
        self.http
            .post(self.url(path))
            .json(&json!({"name": name, "sample": "maven"}))
            .send()
            .await
            .unwrap()
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.http.get(self.url(path)).send().await.unwrap()
    }

    pub async fn get_json(&self, path: &str) -> Value {
        self.get(path).await.json().await.unwrap()
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}
