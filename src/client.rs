//! HTTP client for talking to runners
//!
//! Every call is bounded by a caller-supplied timeout. Failures come back as
//! [`RunnerError`] values; nothing here panics or retries.

use crate::error::GatewayError;
use crate::runner::Runner;
use hyper::body::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Longest error body excerpt kept in a [`RunnerError::Status`]
const MAX_ERROR_BODY: usize = 512;

/// Failure of a single call to a single runner
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RunnerError {
    /// Status code the runner answered with, if it answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            RunnerError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Attribute this failure to `runner_id` for callers that surface it as an error
    pub fn into_gateway_error(self, runner_id: &str) -> GatewayError {
        match self {
            RunnerError::Unreachable(_) | RunnerError::Timeout(_) => GatewayError::RunnerUnreachable {
                runner_id: runner_id.to_string(),
                message: self.to_string(),
            },
            RunnerError::Status { status, .. } => GatewayError::RunnerProtocol {
                runner_id: runner_id.to_string(),
                status: Some(status),
                message: self.to_string(),
            },
            RunnerError::Malformed(_) => GatewayError::RunnerProtocol {
                runner_id: runner_id.to_string(),
                status: None,
                message: self.to_string(),
            },
        }
    }
}

/// One application as reported by a runner. Fields other than `name` pass through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSummary {
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AppSummary {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AppsBody {
    Wrapped { apps: Vec<AppSummary> },
    Bare(Vec<AppSummary>),
}

/// A sample project advertised by a runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Sample {
    /// Identity used for cluster-wide de-duplication: the id, else the name
    pub fn dedup_key(&self) -> Option<&str> {
        self.id.as_deref().or(self.name.as_deref())
    }
}

/// Health and descriptor information reported by a runner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub samples: Vec<Sample>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Forwarding metadata attached to calls made on behalf of a client
#[derive(Debug, Clone, Default)]
pub struct Forwarded {
    pub client_addr: Option<String>,
    pub host: Option<String>,
}

/// A runner's answer to a creation call, relayed verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Shared HTTP client for runner calls
#[derive(Debug, Clone)]
pub struct RunnerClient {
    http: reqwest::Client,
}

impl RunnerClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { http })
    }

    /// `GET /api/v1/apps`
    pub async fn list_apps(
        &self,
        runner: &Runner,
        timeout: Duration,
    ) -> Result<Vec<AppSummary>, RunnerError> {
        let body = self.get_ok(&runner.apps_url(), timeout).await?;
        match serde_json::from_slice::<AppsBody>(&body) {
            Ok(AppsBody::Wrapped { apps }) | Ok(AppsBody::Bare(apps)) => Ok(apps),
            Err(e) => Err(RunnerError::Malformed(e.to_string())),
        }
    }

    /// `GET /api/v1/system`
    pub async fn system_info(
        &self,
        runner: &Runner,
        timeout: Duration,
    ) -> Result<SystemInfo, RunnerError> {
        let body = self.get_ok(&runner.system_url(), timeout).await?;
        serde_json::from_slice(&body).map_err(|e| RunnerError::Malformed(e.to_string()))
    }

    /// `POST /api/v1/apps` with the client's payload. Any answered status is `Ok`.
    pub async fn create_app(
        &self,
        runner: &Runner,
        payload: Bytes,
        forwarded: &Forwarded,
        timeout: Duration,
    ) -> Result<CreateResponse, RunnerError> {
        let mut request = self
            .http
            .post(runner.apps_url())
            .header("content-type", "application/json")
            .body(payload);
        if let Some(ref addr) = forwarded.client_addr {
            request = request.header(X_FORWARDED_FOR, addr.as_str());
        }
        if let Some(ref host) = forwarded.host {
            request = request.header(X_FORWARDED_HOST, host.as_str());
        }

        let call = async {
            let response = request.send().await.map_err(|e| classify(e, timeout))?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let body = response.bytes().await.map_err(|e| classify(e, timeout))?;
            Ok(CreateResponse {
                status,
                content_type,
                body,
            })
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Timeout(timeout)),
        }
    }

    async fn get_ok(&self, url: &str, timeout: Duration) -> Result<Bytes, RunnerError> {
        let call = async {
            let response = self
                .http
                .get(url)
                .header("accept", "application/json")
                .send()
                .await
                .map_err(|e| classify(e, timeout))?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|e| classify(e, timeout))?;
            if status != 200 {
                return Err(RunnerError::Status {
                    status,
                    body: excerpt(&body),
                });
            }
            Ok(body)
        };

        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Timeout(timeout)),
        };
        if let Err(ref e) = result {
            debug!(url, error = %e, "Runner call failed");
        }
        result
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> RunnerError {
    if err.is_timeout() {
        RunnerError::Timeout(timeout)
    } else {
        RunnerError::Unreachable(err.to_string())
    }
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.len() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
