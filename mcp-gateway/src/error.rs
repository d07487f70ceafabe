//! Error types and HTTP/JSON-RPC response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// JSON-RPC error code for "method not found"
pub const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC error code for "internal error" (also used for proxy failures)
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;

/// Sanitize a connection URL by removing credentials
pub fn sanitize_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end + 3];
            let after_at = &url[at_pos + 1..];
            return format!("{}<redacted>@{}", scheme, after_at);
        }
    }
    url.to_string()
}

/// Result type alias using the gateway error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Database error
    #[error("Database error: {0}")]
    Database(Box<sqlx::Error>),

    /// Redis / cache error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Duplicate server registration for `(tenant, name)`
    #[error("Server '{name}' already registered")]
    AlreadyRegistered { name: String, tenant_id: Option<Uuid> },

    /// Unknown server id
    #[error("Server not found: {0}")]
    ServerNotFound(Uuid),

    /// No server exposes the required capabilities
    #[error("No compatible servers found for request")]
    NoCompatibleServer {
        required_tools: Vec<String>,
        required_resources: Vec<String>,
        tenant_id: Option<Uuid>,
    },

    /// Compatible servers exist but none is currently routable
    #[error("No available servers found for request")]
    ServerUnavailable {
        compatible: Vec<Uuid>,
        circuits_open: Vec<Uuid>,
    },

    /// Circuit breaker is open for a specific server
    #[error("Circuit breaker open for server {server_id}")]
    CircuitOpen { server_id: Uuid, failure_count: u32 },

    /// Transport-level proxy failure
    #[error("Proxy error: {message}")]
    Proxy {
        message: String,
        server_id: Option<Uuid>,
    },

    /// The registered transport cannot be proxied
    #[error("Unsupported transport: {transport}")]
    UnsupportedTransport { transport: String, server_id: Uuid },

    /// Operation exceeded its deadline
    #[error("Request timeout after {timeout_secs}s")]
    Timeout { timeout_secs: f64 },

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Authorization error
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Rate limit denial with retry guidance
    #[error("Rate limit exceeded: {description}")]
    RateLimited {
        description: String,
        limit_type: String,
        retry_after_secs: u64,
    },

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Validation error (422)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// External service error (502)
    #[error("External service error: {0}")]
    External(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIGURATION_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Cache(_) => "CACHE_ERROR",
            Error::AlreadyRegistered { .. } => "ALREADY_REGISTERED",
            Error::ServerNotFound(_) => "SERVER_NOT_FOUND",
            Error::NoCompatibleServer { .. } => "NO_COMPATIBLE_SERVER",
            Error::ServerUnavailable { .. } => "SERVER_UNAVAILABLE",
            Error::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Error::Proxy { .. } => "PROXY_ERROR",
            Error::UnsupportedTransport { .. } => "UNSUPPORTED_TRANSPORT",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Unauthorized(_) => "AUTHENTICATION_ERROR",
            Error::Forbidden(_) => "AUTHORIZATION_ERROR",
            Error::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::ValidationError(_) => "VALIDATION_ERROR",
            Error::External(_) => "EXTERNAL_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Coarse error class used for metric labels and severity selection
    pub fn error_class(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "authentication",
            Error::Forbidden(_) => "authorization",
            Error::RateLimited { .. } => "rate_limit",
            Error::ValidationError(_) | Error::BadRequest(_) => "validation",
            Error::NoCompatibleServer { .. }
            | Error::ServerUnavailable { .. }
            | Error::CircuitOpen { .. } => "routing",
            Error::Proxy { .. } | Error::UnsupportedTransport { .. } | Error::Timeout { .. } => {
                "proxy"
            }
            Error::Config(_) | Error::Database(_) | Error::Cache(_) | Error::Io(_) => "system",
            _ => "unknown",
        }
    }

    /// JSON-RPC error object for this error, suitable as the `error` member
    /// of a response envelope. Standard codes only; diagnostics go in `data`.
    pub fn to_jsonrpc_error(&self) -> serde_json::Value {
        match self {
            Error::Timeout { timeout_secs } => json!({
                "code": JSONRPC_INTERNAL_ERROR,
                "message": "Request timeout",
                "data": { "timeout": timeout_secs },
            }),
            Error::UnsupportedTransport { transport, .. } => json!({
                "code": JSONRPC_INTERNAL_ERROR,
                "message": "Internal error",
                "data": { "error": "Unsupported transport", "transport": transport },
            }),
            Error::RateLimited {
                description,
                limit_type,
                retry_after_secs,
            } => json!({
                "code": JSONRPC_INTERNAL_ERROR,
                "message": "Internal error",
                "data": {
                    "error": description,
                    "error_code": "RATE_LIMIT_EXCEEDED",
                    "limit_type": limit_type,
                    "retry_after": retry_after_secs,
                },
            }),
            Error::NoCompatibleServer {
                required_tools,
                required_resources,
                ..
            } => json!({
                "code": JSONRPC_INTERNAL_ERROR,
                "message": "Internal error",
                "data": {
                    "error_code": "NO_COMPATIBLE_SERVER",
                    "required_tools": required_tools,
                    "required_resources": required_resources,
                },
            }),
            Error::ServerUnavailable { compatible, .. } => json!({
                "code": JSONRPC_INTERNAL_ERROR,
                "message": "Internal error",
                "data": {
                    "error_code": "SERVER_UNAVAILABLE",
                    "compatible_servers": compatible,
                },
            }),
            other => json!({
                "code": JSONRPC_INTERNAL_ERROR,
                "message": "Internal error",
                "data": { "error_code": other.error_code(), "details": other.to_string() },
            }),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,

    /// Stable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,

    /// Structured context (compatible server ids, retry hints, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
            context: None,
        }
    }

    /// Create error response with a code
    pub fn with_code(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
            context: None,
        }
    }

    /// Attach structured context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let (status, mut body) = match &self {
            Error::Config(e) => {
                tracing::error!("Configuration error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        code,
                        "Configuration error",
                    ),
                )
            }

            Error::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        code,
                        "Database operation failed",
                    ),
                )
            }

            Error::Cache(e) => {
                tracing::error!("Cache error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        code,
                        "Cache operation failed",
                    ),
                )
            }

            Error::AlreadyRegistered { name, .. } => (
                StatusCode::CONFLICT,
                ErrorResponse::with_code(
                    StatusCode::CONFLICT,
                    code,
                    format!("Server '{}' already registered", name),
                ),
            ),

            Error::ServerNotFound(id) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(
                    StatusCode::NOT_FOUND,
                    code,
                    format!("Server not found: {}", id),
                ),
            ),

            Error::NoCompatibleServer {
                required_tools,
                required_resources,
                ..
            } => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, code, self.to_string())
                    .with_context(json!({
                        "required_tools": required_tools,
                        "required_resources": required_resources,
                    })),
            ),

            Error::ServerUnavailable {
                compatible,
                circuits_open,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::with_code(StatusCode::SERVICE_UNAVAILABLE, code, self.to_string())
                    .with_context(json!({
                        "compatible_servers": compatible,
                        "circuit_breakers_open": circuits_open,
                    })),
            ),

            Error::CircuitOpen { server_id, failure_count } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::with_code(StatusCode::SERVICE_UNAVAILABLE, code, self.to_string())
                    .with_context(json!({
                        "server_id": server_id,
                        "failure_count": failure_count,
                    })),
            ),

            Error::Proxy { .. } => {
                tracing::error!("{}", self);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(
                        StatusCode::BAD_GATEWAY,
                        code,
                        "Upstream request failed",
                    ),
                )
            }

            Error::UnsupportedTransport { transport, .. } => (
                StatusCode::NOT_IMPLEMENTED,
                ErrorResponse::with_code(
                    StatusCode::NOT_IMPLEMENTED,
                    code,
                    format!("Unsupported transport: {}", transport),
                ),
            ),

            Error::Timeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::with_code(StatusCode::GATEWAY_TIMEOUT, code, self.to_string()),
            ),

            Error::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, code, msg.clone()),
            ),

            Error::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(StatusCode::FORBIDDEN, code, msg.clone()),
            ),

            Error::RateLimited {
                description,
                limit_type,
                retry_after_secs,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse::with_code(StatusCode::TOO_MANY_REQUESTS, code, description.clone())
                    .with_context(json!({
                        "limit_type": limit_type,
                        "retry_after": retry_after_secs,
                    })),
            ),

            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, code, msg.clone()),
            ),

            Error::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, code, msg.clone()),
            ),

            Error::ValidationError(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse::with_code(StatusCode::UNPROCESSABLE_ENTITY, code, msg.clone()),
            ),

            Error::External(msg) => {
                tracing::error!("External service error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(
                        StatusCode::BAD_GATEWAY,
                        code,
                        "External service unavailable",
                    ),
                )
            }

            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        code,
                        "I/O operation failed",
                    ),
                )
            }

            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        code,
                        "Internal server error",
                    ),
                )
            }
        };

        body.status = status.as_u16();

        let mut response = (status, Json(body)).into_response();

        match &self {
            Error::Unauthorized(_) => {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", http::HeaderValue::from_static("Bearer"));
            }
            Error::RateLimited { retry_after_secs, .. } => {
                if let Ok(value) = http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert("Retry-After", value);
                }
            }
            _ => {}
        }

        response
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(Box::new(err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Cache(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = Error::NoCompatibleServer {
            required_tools: vec!["read_file".to_string()],
            required_resources: vec![],
            tenant_id: None,
        };
        assert_eq!(err.error_code(), "NO_COMPATIBLE_SERVER");

        let err = Error::ServerUnavailable {
            compatible: vec![],
            circuits_open: vec![],
        };
        assert_eq!(err.error_code(), "SERVER_UNAVAILABLE");

        let err = Error::RateLimited {
            description: "too fast".to_string(),
            limit_type: "user".to_string(),
            retry_after_secs: 5,
        };
        assert_eq!(err.error_code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(err.error_class(), "rate_limit");
    }

    #[test]
    fn test_timeout_jsonrpc_shape() {
        let err = Error::Timeout { timeout_secs: 15.0 };
        let rpc = err.to_jsonrpc_error();
        assert_eq!(rpc["code"], JSONRPC_INTERNAL_ERROR);
        assert_eq!(rpc["message"], "Request timeout");
        assert_eq!(rpc["data"]["timeout"], 15.0);
    }

    #[test]
    fn test_unsupported_transport_jsonrpc_shape() {
        let err = Error::UnsupportedTransport {
            transport: "stdio".to_string(),
            server_id: Uuid::nil(),
        };
        let rpc = err.to_jsonrpc_error();
        assert_eq!(rpc["code"], JSONRPC_INTERNAL_ERROR);
        assert_eq!(rpc["data"]["error"], "Unsupported transport");
    }

    #[test]
    fn test_sanitize_url() {
        assert_eq!(
            sanitize_url("postgres://user:pass@db:5432/gateway"),
            "postgres://<redacted>@db:5432/gateway"
        );
        assert_eq!(sanitize_url("redis://cache:6379"), "redis://cache:6379");
    }
}
