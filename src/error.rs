//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Error codes reported in JSON error bodies and the X-Gateway-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A runner with this id is already registered
    DuplicateRunner,
    /// No runner with this id
    RunnerNotFound,
    /// Runner definition is malformed
    InvalidRunner,
    /// A runner could not be reached
    RunnerUnreachable,
    /// A runner answered with an unexpected status or body
    RunnerProtocolError,
    /// Application name is already mapped
    NameConflict,
    /// Creation payload is malformed
    InvalidPayload,
    /// No runner could take the application
    CapacityExhausted,
    /// A fan-out query exceeded its overall ceiling
    AggregateTimeout,
    /// The cluster snapshot could not be written
    PersistenceFailure,
    /// No application or runner matches the request path
    UnknownApp,
    /// Request timed out waiting for the backend
    RequestTimeout,
    /// Failed to connect to the backend
    ConnectionFailed,
    /// Internal gateway error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::DuplicateRunner => StatusCode::CONFLICT,
            ErrorCode::RunnerNotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidRunner => StatusCode::BAD_REQUEST,
            ErrorCode::RunnerUnreachable => StatusCode::BAD_GATEWAY,
            ErrorCode::RunnerProtocolError => StatusCode::BAD_GATEWAY,
            ErrorCode::NameConflict => StatusCode::CONFLICT,
            ErrorCode::InvalidPayload => StatusCode::BAD_REQUEST,
            ErrorCode::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::AggregateTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::PersistenceFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::DuplicateRunner => "DUPLICATE_RUNNER",
            ErrorCode::RunnerNotFound => "RUNNER_NOT_FOUND",
            ErrorCode::InvalidRunner => "INVALID_RUNNER",
            ErrorCode::RunnerUnreachable => "RUNNER_UNREACHABLE",
            ErrorCode::RunnerProtocolError => "RUNNER_PROTOCOL_ERROR",
            ErrorCode::NameConflict => "NAME_CONFLICT",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::CapacityExhausted => "CAPACITY_EXHAUSTED",
            ErrorCode::AggregateTimeout => "AGGREGATE_TIMEOUT",
            ErrorCode::PersistenceFailure => "PERSISTENCE_FAILURE",
            ErrorCode::UnknownApp => "UNKNOWN_APP",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// One failed creation attempt against a runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptFailure {
    pub runner_id: String,
    /// Status the runner answered with, absent for network failures and timeouts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.runner_id, self.message)
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("runner already registered: {0}")]
    DuplicateRunner(String),

    #[error("runner not found: {0}")]
    RunnerNotFound(String),

    #[error("invalid runner: {0}")]
    InvalidRunner(String),

    #[error("{runner_id}: {message}")]
    RunnerUnreachable { runner_id: String, message: String },

    #[error("{runner_id}: {message}")]
    RunnerProtocol {
        runner_id: String,
        status: Option<u16>,
        message: String,
    },

    #[error("application already exists: {0}")]
    NameConflict(String),

    #[error("invalid creation payload: {0}")]
    InvalidPayload(String),

    /// A single recorded attempt is surfaced verbatim, several are aggregated
    #[error("{}", capacity_message(.0))]
    CapacityExhausted(Vec<AttemptFailure>),

    #[error("cluster query exceeded {}s", .0.as_secs())]
    AggregateTimeout(Duration),

    #[error("failed to persist cluster state: {0}")]
    Persistence(String),

    #[error("fan-out interrupted: {0}")]
    Interrupted(String),
}

fn capacity_message(attempts: &[AttemptFailure]) -> String {
    match attempts {
        [single] => single.message.clone(),
        [] => "no runner has free capacity".to_string(),
        many => format!(
            "no runner has free capacity, {} attempts failed: {}",
            many.len(),
            many.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        ),
    }
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::DuplicateRunner(_) => ErrorCode::DuplicateRunner,
            GatewayError::RunnerNotFound(_) => ErrorCode::RunnerNotFound,
            GatewayError::InvalidRunner(_) => ErrorCode::InvalidRunner,
            GatewayError::RunnerUnreachable { .. } => ErrorCode::RunnerUnreachable,
            GatewayError::RunnerProtocol { .. } => ErrorCode::RunnerProtocolError,
            GatewayError::NameConflict(_) => ErrorCode::NameConflict,
            GatewayError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            GatewayError::CapacityExhausted(_) => ErrorCode::CapacityExhausted,
            GatewayError::AggregateTimeout(_) => ErrorCode::AggregateTimeout,
            GatewayError::Persistence(_) => ErrorCode::PersistenceFailure,
            GatewayError::Interrupted(_) => ErrorCode::InternalError,
        }
    }

    /// HTTP status for this error.
    ///
    /// A placement that failed against exactly one runner relays that runner's status.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::CapacityExhausted(attempts) => match attempts.as_slice() {
                [single] => single
                    .status
                    .and_then(|s| StatusCode::from_u16(s).ok())
                    .unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            GatewayError::RunnerProtocol {
                status: Some(status),
                ..
            } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            other => other.code().status_code(),
        }
    }

    /// Render this error as a JSON response
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let status = self.status_code();
        let error = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        build_error_response(&error, status)
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    build_error_response(&error, code.status_code())
}

fn build_error_response(
    error: &ErrorResponse,
    status: StatusCode,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", error.code.as_header_value())
        .body(
            Full::new(Bytes::from(error.to_json()))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}
