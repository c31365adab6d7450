use hyper::StatusCode;
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// Main error type for the service router
#[derive(Error, Debug, Clone)]
pub enum RouterError {
    /// Malformed or semantically invalid input
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// A service or other named resource does not exist
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    /// Registration collided with an existing identifier
    #[error("Service already exists: {id}")]
    AlreadyExists { id: String },

    /// Unknown load balancing algorithm name
    #[error("Invalid load balancing algorithm: {name}")]
    InvalidAlgorithm { name: String },

    /// Empty candidate set at selection time
    #[error("No healthy services available")]
    NoHealthyServices,

    /// A dependent component is not initialized
    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// Rate limiter refused admission
    #[error("Rate limit exceeded for {key}")]
    RateLimitExceeded { key: String, limit: u64, reset_at: i64 },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Upstream connection failed or timed out
    #[error("Bad gateway: {target}: {message}")]
    BadGateway { target: String, message: String },

    /// Request handling exceeded its deadline
    #[error("Gateway timeout after {duration:?}: {operation}")]
    GatewayTimeout {
        duration: Duration,
        operation: String,
    },

    /// Health checks already scheduled
    #[error("{component} is already running")]
    AlreadyRunning { component: String },

    /// Router start called twice
    #[error("Router already started")]
    AlreadyStarted,

    /// Lifecycle transition not allowed from the current state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Persistence backend errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Internal server errors
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl RouterError {
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a not found error for a service id
    pub fn service_not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound {
            resource: "service".to_string(),
            id: id.into(),
        }
    }

    pub fn not_found<R: Into<String>, S: Into<String>>(resource: R, id: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn already_exists<S: Into<String>>(id: S) -> Self {
        Self::AlreadyExists { id: id.into() }
    }

    pub fn invalid_algorithm<S: Into<String>>(name: S) -> Self {
        Self::InvalidAlgorithm { name: name.into() }
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn service_unavailable<S: Into<String>>(message: S) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    pub fn rate_limited<S: Into<String>>(key: S, limit: u64, reset_at: i64) -> Self {
        Self::RateLimitExceeded {
            key: key.into(),
            limit,
            reset_at,
        }
    }

    pub fn bad_gateway<T: Into<String>, S: Into<String>>(target: T, message: S) -> Self {
        Self::BadGateway {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn gateway_timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::GatewayTimeout {
            duration,
            operation: operation.into(),
        }
    }

    pub fn already_running<S: Into<String>>(component: S) -> Self {
        Self::AlreadyRunning {
            component: component.into(),
        }
    }

    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable code rendered in the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::InvalidRequest { .. } => "INVALID_REQUEST",
            RouterError::NotFound { .. } => "NOT_FOUND",
            RouterError::AlreadyExists { .. } => "ALREADY_EXISTS",
            RouterError::InvalidAlgorithm { .. } => "INVALID_ALGORITHM",
            RouterError::NoHealthyServices | RouterError::ServiceUnavailable { .. } => {
                "SERVICE_UNAVAILABLE"
            }
            RouterError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            RouterError::Unauthorized { .. } => "UNAUTHORIZED",
            RouterError::Forbidden { .. } => "FORBIDDEN",
            RouterError::BadGateway { .. } => "BAD_GATEWAY",
            RouterError::GatewayTimeout { .. } => "GATEWAY_TIMEOUT",
            RouterError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            RouterError::AlreadyStarted => "ALREADY_STARTED",
            RouterError::InvalidState { .. }
            | RouterError::Config { .. }
            | RouterError::Storage { .. }
            | RouterError::Internal { .. } => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Fixed HTTP status for each error kind
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::InvalidRequest { .. } | RouterError::InvalidAlgorithm { .. } => {
                StatusCode::BAD_REQUEST
            }
            RouterError::NotFound { .. } => StatusCode::NOT_FOUND,
            RouterError::AlreadyExists { .. }
            | RouterError::AlreadyRunning { .. }
            | RouterError::AlreadyStarted => StatusCode::CONFLICT,
            RouterError::NoHealthyServices | RouterError::ServiceUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RouterError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RouterError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            RouterError::Forbidden { .. } => StatusCode::FORBIDDEN,
            RouterError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            RouterError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RouterError::InvalidState { .. }
            | RouterError::Config { .. }
            | RouterError::Storage { .. }
            | RouterError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to HTTP clients. Internal failures collapse to a
    /// generic text so backend error strings never leak.
    pub fn public_message(&self) -> String {
        match self {
            RouterError::InvalidState { .. }
            | RouterError::Config { .. }
            | RouterError::Storage { .. }
            | RouterError::Internal { .. } => "internal server error".to_string(),
            RouterError::BadGateway { .. } => "upstream service request failed".to_string(),
            other => other.to_string(),
        }
    }

    /// Optional structured details for the error envelope
    pub fn details(&self) -> Option<Value> {
        let mut map = Map::new();
        match self {
            RouterError::NotFound { resource, id } => {
                map.insert("resource".into(), json!(resource));
                map.insert("id".into(), json!(id));
            }
            RouterError::AlreadyExists { id } => {
                map.insert("id".into(), json!(id));
            }
            RouterError::InvalidAlgorithm { name } => {
                map.insert("algorithm".into(), json!(name));
            }
            RouterError::RateLimitExceeded {
                limit, reset_at, ..
            } => {
                map.insert("limit".into(), json!(limit));
                map.insert("reset".into(), json!(reset_at));
            }
            RouterError::BadGateway { target, .. } => {
                map.insert("target".into(), json!(target));
            }
            RouterError::GatewayTimeout { duration, .. } => {
                map.insert("timeout_ms".into(), json!(duration.as_millis() as u64));
            }
            _ => return None,
        }
        Some(Value::Object(map))
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RouterError::Config { .. } => ErrorSeverity::Critical,
            RouterError::Internal { .. }
            | RouterError::InvalidState { .. }
            | RouterError::Storage { .. } => ErrorSeverity::High,
            RouterError::BadGateway { .. }
            | RouterError::GatewayTimeout { .. }
            | RouterError::NoHealthyServices
            | RouterError::ServiceUnavailable { .. } => ErrorSeverity::Medium,
            _ => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for router operations
pub type RouterResult<T> = Result<T, RouterError>;

impl From<anyhow::Error> for RouterError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(router_err) = err.downcast_ref::<RouterError>() {
            return router_err.clone();
        }
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return RouterError::internal(format!("IO error: {}", io_err));
        }
        RouterError::config(err.to_string())
    }
}

impl From<std::io::Error> for RouterError {
    fn from(err: std::io::Error) -> Self {
        RouterError::internal(format!("IO error: {}", err))
    }
}

impl From<hyper::Error> for RouterError {
    fn from(err: hyper::Error) -> Self {
        RouterError::bad_gateway("upstream", err.to_string())
    }
}

impl From<hyper::http::Error> for RouterError {
    fn from(err: hyper::http::Error) -> Self {
        RouterError::internal(format!("HTTP error: {}", err))
    }
}

impl From<toml::de::Error> for RouterError {
    fn from(err: toml::de::Error) -> Self {
        RouterError::config(format!("TOML parsing error: {}", err))
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        RouterError::internal(format!("JSON serialization error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for RouterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RouterError::gateway_timeout(Duration::from_secs(30), "operation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RouterError::service_not_found("svc-1");
        assert!(matches!(err, RouterError::NotFound { .. }));
        assert_eq!(err.to_string(), "service not found: svc-1");

        let err = RouterError::already_exists("svc-1");
        assert_eq!(err.to_string(), "Service already exists: svc-1");

        let err = RouterError::gateway_timeout(Duration::from_secs(30), "proxy request");
        assert_eq!(
            err.to_string(),
            "Gateway timeout after 30s: proxy request"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RouterError::invalid_request("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RouterError::service_not_found("x").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RouterError::already_exists("x").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RouterError::NoHealthyServices.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RouterError::rate_limited("k", 1, 0).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            RouterError::bad_gateway("t", "refused").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RouterError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(RouterError::NoHealthyServices.code(), "SERVICE_UNAVAILABLE");
        assert_eq!(RouterError::invalid_algorithm("x").code(), "INVALID_ALGORITHM");
        assert_eq!(RouterError::storage("disk").code(), "INTERNAL_SERVER_ERROR");
    }

    #[test]
    fn test_internal_message_is_not_exposed() {
        let err = RouterError::internal("db password=hunter2 rejected");
        assert_eq!(err.public_message(), "internal server error");
        assert!(err.details().is_none());

        let err = RouterError::bad_gateway("10.0.0.1:80", "connection refused (os error 111)");
        assert!(!err.public_message().contains("os error"));
    }

    #[test]
    fn test_details() {
        let details = RouterError::service_not_found("abc").details().unwrap();
        assert_eq!(details["id"], "abc");
        assert_eq!(details["resource"], "service");
        assert!(RouterError::invalid_request("x").details().is_none());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::High > ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium > ErrorSeverity::Low);
        assert_eq!(RouterError::config("x").severity(), ErrorSeverity::Critical);
    }
}
