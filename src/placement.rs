//! Placement of new applications onto runners
//!
//! A creation request walks a small state machine:
//!
//! ```text
//! Allocating ──runner──▶ Attempting ──2xx/4xx──▶ Succeeded
//!     ▲                      │
//!     └────5xx / failure─────┘   (runner excluded, reservation released)
//! Allocating ──no runner──▶ ExhaustedSingleError | ExhaustedMultiError
//! ```
//!
//! Attempts for one request are strictly sequential. The exclusion set and the recorded
//! failures travel with the state rather than living in shared fields. The reservation
//! for the runner being attempted travels with `Attempting`, so a request dropped
//! mid-call gives its slot back.

use crate::client::{CreateResponse, Forwarded};
use crate::cluster::{ClusterRegistry, Reservation};
use crate::directory::Directory;
use crate::error::{AttemptFailure, GatewayError};
use crate::sync::Synchronizer;
use hyper::body::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for a single creation call to a runner
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// First path segments served by the gateway itself
pub const RESERVED_NAMES: &[&str] = &["api", "health", "version"];

/// A request to create an application
#[derive(Debug, Clone, Default)]
pub struct CreationRequest {
    /// Raw creation payload, forwarded to the runner untouched
    pub payload: Bytes,
    /// Runner ids the client asked us not to use
    pub excluded: Vec<String>,
    pub forwarded: Forwarded,
}

/// The runner's answer to a creation request, relayed to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationResult {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub runner_id: String,
    /// Name registered in the directory, set only for a 201 answer
    pub created: Option<String>,
}

/// Exclusions and failures accumulated over the attempts of one request
#[derive(Debug, Default)]
struct Progress {
    excluded: HashSet<String>,
    failures: Vec<AttemptFailure>,
}

enum PlacementState {
    Allocating(Progress),
    Attempting(Reservation, Progress),
    Succeeded(CreationResult),
    ExhaustedSingleError(AttemptFailure),
    ExhaustedMultiError(Vec<AttemptFailure>),
}

pub struct PlacementOrchestrator {
    registry: Arc<ClusterRegistry>,
    directory: Arc<Directory>,
    synchronizer: Synchronizer,
    create_timeout: Duration,
}

impl PlacementOrchestrator {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        directory: Arc<Directory>,
        synchronizer: Synchronizer,
    ) -> Self {
        Self {
            registry,
            directory,
            synchronizer,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
        }
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    /// Place a new application on the least-loaded runner that accepts it
    pub async fn create_application(
        &self,
        request: CreationRequest,
    ) -> Result<CreationResult, GatewayError> {
        let report = self.synchronizer.refresh_all(&self.registry.list()).await?;
        if !report.errors.is_empty() {
            warn!(errors = ?report.errors, "Placing with a partial view of the cluster");
        }

        let name = application_name(&request.payload)?;
        if self.directory.contains(&name) {
            info!(app = name, "Creation rejected, name already mapped");
            return Err(GatewayError::NameConflict(name));
        }

        let mut state = PlacementState::Allocating(Progress {
            excluded: request.excluded.iter().cloned().collect(),
            failures: Vec::new(),
        });

        loop {
            state = match state {
                PlacementState::Allocating(progress) => self.allocate(progress),
                PlacementState::Attempting(reservation, progress) => {
                    self.attempt(&name, &request, reservation, progress).await
                }
                PlacementState::Succeeded(result) => return Ok(result),
                PlacementState::ExhaustedSingleError(failure) => {
                    warn!(app = name, error = %failure, "Placement failed");
                    return Err(GatewayError::CapacityExhausted(vec![failure]));
                }
                PlacementState::ExhaustedMultiError(failures) => {
                    warn!(app = name, attempts = failures.len(), "No runner could take the application");
                    return Err(GatewayError::CapacityExhausted(failures));
                }
            };
        }
    }

    fn allocate(&self, mut progress: Progress) -> PlacementState {
        match self.registry.allocate(&self.directory, &progress.excluded) {
            Some(reservation) => PlacementState::Attempting(reservation, progress),
            None if progress.failures.len() == 1 => match progress.failures.pop() {
                Some(failure) => PlacementState::ExhaustedSingleError(failure),
                None => PlacementState::ExhaustedMultiError(Vec::new()),
            },
            None => PlacementState::ExhaustedMultiError(progress.failures),
        }
    }

    async fn attempt(
        &self,
        name: &str,
        request: &CreationRequest,
        reservation: Reservation,
        mut progress: Progress,
    ) -> PlacementState {
        let runner = Arc::clone(reservation.runner());
        debug!(app = name, runner_id = runner.id(), "Attempting placement");
        let outcome = self
            .synchronizer
            .client()
            .create_app(
                &runner,
                request.payload.clone(),
                &request.forwarded,
                self.create_timeout,
            )
            .await;

        let failure = match outcome {
            Ok(response) if response.status >= 500 => AttemptFailure {
                runner_id: runner.id().to_string(),
                status: Some(response.status),
                message: failure_message(&response),
            },
            Err(e) => AttemptFailure {
                runner_id: runner.id().to_string(),
                status: e.status(),
                message: e.to_string(),
            },
            Ok(response) => return self.settle(name, reservation, response),
        };

        warn!(
            app = name,
            runner_id = runner.id(),
            error = %failure,
            "Placement attempt failed, excluding runner"
        );
        self.registry.release(reservation, &self.directory);
        progress.excluded.insert(runner.id().to_string());
        progress.failures.push(failure);
        PlacementState::Allocating(progress)
    }

    fn settle(
        &self,
        name: &str,
        reservation: Reservation,
        response: CreateResponse,
    ) -> PlacementState {
        let runner = Arc::clone(reservation.runner());
        let created = if response.status == 201 {
            self.directory.add(name, &runner.app_location(name));
            info!(app = name, runner_id = runner.id(), "Application placed");
            Some(name.to_string())
        } else {
            info!(
                app = name,
                runner_id = runner.id(),
                status = response.status,
                "Runner answered creation without creating"
            );
            None
        };
        self.registry.release(reservation, &self.directory);

        PlacementState::Succeeded(CreationResult {
            status: response.status,
            content_type: response.content_type,
            body: response.body,
            runner_id: runner.id().to_string(),
            created,
        })
    }
}

/// Extract the application name from a JSON creation payload
pub fn application_name(payload: &[u8]) -> Result<String, GatewayError> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| GatewayError::InvalidPayload(format!("payload is not JSON: {}", e)))?;
    let name = value
        .get("name")
        .and_then(|n| n.as_str())
        .map(str::trim)
        .ok_or_else(|| GatewayError::InvalidPayload("missing string field \"name\"".into()))?;

    if name.is_empty() {
        return Err(GatewayError::InvalidPayload("name is empty".into()));
    }
    if RESERVED_NAMES.iter().any(|r| name.eq_ignore_ascii_case(r)) {
        return Err(GatewayError::InvalidPayload(format!("name {:?} is reserved", name)));
    }
    if name.chars().any(|c| c == '/' || c == '?' || c == '#' || c.is_whitespace()) {
        return Err(GatewayError::InvalidPayload(format!(
            "name {:?} is not a valid path segment",
            name
        )));
    }
    Ok(name.to_string())
}

fn failure_message(response: &CreateResponse) -> String {
    let text = String::from_utf8_lossy(&response.body);
    let text = text.trim();
    if text.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        text.to_string()
    }
}
