//! Gateway REST surface
//!
//! Runner management, application creation and the cluster-wide read queries. Any
//! request that [`route`] does not recognise belongs to the router.

use crate::client::Forwarded;
use crate::error::{json_error_response, ErrorCode, GatewayError};
use crate::gateway::Gateway;
use crate::placement::CreationRequest;
use crate::runner::RunnerRecord;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const RUNNERS_PATH: &str = "/api/v1/runners";
const APPS_PATH: &str = "/api/v1/apps";
const SYSTEM_PATH: &str = "/api/v1/system";

pub type ApiResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Requests answered by the gateway itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRoute {
    Health,
    Version,
    ListRunners,
    RegisterRunner,
    GetRunner(String),
    UpdateRunner(String),
    DeregisterRunner(String),
    RunnerApps(String),
    ListApps,
    CreateApp,
    System,
}

/// Body of `PUT /api/v1/runners/{id}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerUpdate {
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
    pub max_apps: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunnerAppsBody<'a, T: Serialize> {
    runner_id: &'a str,
    apps: &'a [T],
    count: usize,
}

/// Match a request against the gateway's own endpoints
pub fn route(method: &Method, path: &str) -> Option<ApiRoute> {
    let route = match (method, path) {
        (&Method::GET, "/health") => ApiRoute::Health,
        (&Method::GET, "/version") => ApiRoute::Version,
        (&Method::GET, RUNNERS_PATH) => ApiRoute::ListRunners,
        (&Method::POST, RUNNERS_PATH) => ApiRoute::RegisterRunner,
        (&Method::GET, APPS_PATH) => ApiRoute::ListApps,
        (&Method::POST, APPS_PATH) => ApiRoute::CreateApp,
        (&Method::GET, SYSTEM_PATH) => ApiRoute::System,
        (method, path) => {
            let rest = path.strip_prefix(RUNNERS_PATH)?.strip_prefix('/')?;
            let (id, sub) = match rest.split_once('/') {
                Some((id, sub)) => (id, Some(sub)),
                None => (rest, None),
            };
            if id.is_empty() {
                return None;
            }
            let id = urlencoding::decode(id).ok()?.into_owned();
            match (method, sub) {
                (&Method::GET, None) => ApiRoute::GetRunner(id),
                (&Method::PUT, None) => ApiRoute::UpdateRunner(id),
                (&Method::DELETE, None) => ApiRoute::DeregisterRunner(id),
                (&Method::GET, Some("apps")) => ApiRoute::RunnerApps(id),
                _ => return None,
            }
        }
    };
    Some(route)
}

/// Answer a request that [`route`] matched
pub async fn handle(
    gateway: &Gateway,
    route: ApiRoute,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> ApiResponse {
    debug!(?route, "API request");
    let result = match route {
        ApiRoute::Health => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
        ApiRoute::Version => {
            let version = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            Ok(json_response(StatusCode::OK, version.to_string()))
        }
        ApiRoute::ListRunners => Ok(json_value(StatusCode::OK, &gateway.list_runners())),
        ApiRoute::RegisterRunner => register_runner(gateway, req).await,
        ApiRoute::GetRunner(id) => gateway
            .get_runner(&id)
            .map(|runner| json_value(StatusCode::OK, &runner)),
        ApiRoute::UpdateRunner(id) => update_runner(gateway, &id, req).await,
        ApiRoute::DeregisterRunner(id) => gateway
            .deregister_runner(&id)
            .map(|_| empty_response(StatusCode::NO_CONTENT)),
        ApiRoute::RunnerApps(id) => gateway.runner_apps(&id).await.map(|apps| {
            json_value(
                StatusCode::OK,
                &RunnerAppsBody {
                    runner_id: &id,
                    apps: &apps,
                    count: apps.len(),
                },
            )
        }),
        ApiRoute::ListApps => gateway
            .list_applications()
            .await
            .map(|listing| json_value(StatusCode::OK, &listing)),
        ApiRoute::CreateApp => create_app(gateway, req, client_addr).await,
        ApiRoute::System => gateway
            .system_overview()
            .await
            .map(|overview| json_value(StatusCode::OK, &overview)),
    };

    result.unwrap_or_else(|e| {
        debug!(code = e.code().as_header_value(), error = %e, "API request failed");
        e.into_response()
    })
}

async fn register_runner(gateway: &Gateway, req: Request<Incoming>) -> Result<ApiResponse, GatewayError> {
    let body = read_body(req).await?;
    let record: RunnerRecord = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::InvalidRunner(format!("invalid runner definition: {}", e)))?;
    let descriptor = gateway.register_runner(record).await?;
    Ok(json_value(StatusCode::CREATED, &descriptor))
}

async fn update_runner(
    gateway: &Gateway,
    id: &str,
    req: Request<Incoming>,
) -> Result<ApiResponse, GatewayError> {
    let body = read_body(req).await?;
    let update: RunnerUpdate = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::InvalidRunner(format!("invalid runner definition: {}", e)))?;
    if let Some(ref body_id) = update.id {
        if body_id != id {
            return Err(GatewayError::InvalidRunner(format!(
                "runner id {:?} does not match path id {:?}",
                body_id, id
            )));
        }
    }
    let descriptor = gateway.update_runner(id, &update.url, update.max_apps).await?;
    Ok(json_value(StatusCode::OK, &descriptor))
}

async fn create_app(
    gateway: &Gateway,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Result<ApiResponse, GatewayError> {
    let excluded = excluded_runners(req.uri().query());
    let forwarded = Forwarded {
        client_addr: Some(client_addr.ip().to_string()),
        host: req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(String::from),
    };
    let payload = read_body(req).await?;

    let result = gateway
        .create_application(CreationRequest {
            payload,
            excluded,
            forwarded,
        })
        .await?;

    let status = StatusCode::from_u16(result.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder()
        .status(status)
        .header("x-runner-id", result.runner_id.as_str());
    if let Some(ref content_type) = result.content_type {
        builder = builder.header(CONTENT_TYPE, content_type.as_str());
    }
    if let Some(ref name) = result.created {
        info!(app = %name, runner_id = %result.runner_id, "Application created");
    }
    builder
        .body(full(result.body))
        .map_err(|e| GatewayError::Interrupted(format!("failed to relay creation response: {}", e)))
}

/// Runner ids from every `exclude` query parameter, comma separated
pub fn excluded_runners(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == "exclude")
        .flat_map(|(_, value)| value.split(','))
        .filter_map(|id| urlencoding::decode(&id.replace('+', " ")).ok().map(|s| s.trim().to_string()))
        .filter(|id| !id.is_empty())
        .collect()
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, GatewayError> {
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| GatewayError::InvalidPayload(format!("failed to read request body: {}", e)))
}

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn empty_response(status: StatusCode) -> ApiResponse {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> ApiResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(body))
        .expect("valid response with StatusCode enum and static header")
}

fn json_value<T: Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(status, body),
        Err(e) => {
            error!(error = %e, "Failed to encode API response");
            json_error_response(ErrorCode::InternalError, "failed to encode response")
        }
    }
}
