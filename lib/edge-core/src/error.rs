use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Instance {instance_id} is already registered for service {service}")]
    DuplicateInstance { service: String, instance_id: String },

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("No route matches path: {0}")]
    RouteNotFound(String),

    #[error("No instance available for service: {0}")]
    NoInstanceAvailable(String),

    #[error("Upstream failure for service {service}: {reason}")]
    UpstreamFailure { service: String, reason: String },

    #[error("Upstream for service {service} timed out after {timeout:?}")]
    UpstreamTimeout { service: String, timeout: Duration },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::DuplicateInstance { .. } => "DUPLICATE_INSTANCE",
            CoreError::InvalidRegistration(_) => "INVALID_REGISTRATION",
            CoreError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            CoreError::NoInstanceAvailable(_) => "NO_INSTANCE_AVAILABLE",
            CoreError::UpstreamFailure { .. } => "UPSTREAM_FAILURE",
            CoreError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code the error is reported with
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::DuplicateInstance { .. } => 409,
            CoreError::InvalidRegistration(_) => 400,
            CoreError::RouteNotFound(_) => 404,
            CoreError::NoInstanceAvailable(_) => 503,
            CoreError::UpstreamFailure { .. } => 502,
            CoreError::UpstreamTimeout { .. } => 504,
            CoreError::Internal(_) => 500,
        }
    }
}

/// Structured error body returned to callers.
///
/// Handler failures produced outside the gateway arrive in this same shape
/// and are passed through untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub status_code: u16,
}

impl ErrorResponse {
    pub fn new(
        error_code: impl Into<String>,
        message: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Serialize to a JSON body
    pub fn to_json(&self) -> Vec<u8> {
        // A struct of strings and an integer always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }
}

impl From<&CoreError> for ErrorResponse {
    fn from(error: &CoreError) -> Self {
        Self::new(error.error_code(), error.to_string(), error.status_code())
    }
}

impl From<CoreError> for ErrorResponse {
    fn from(error: CoreError) -> Self {
        Self::from(&error)
    }
}
