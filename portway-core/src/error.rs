use chrono::Utc;
use thiserror::Error;

/// Unified error type for the Portway request pipeline.
///
/// Every variant maps to an HTTP status and serialises to the gateway's
/// error envelope. Vendor details (raw SQL errors, upstream internals)
/// never appear in an envelope; they are logged with the request id.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Access denied for endpoint {requested}")]
    ScopeDenied {
        requested: String,
        available_scopes: String,
    },

    #[error("Environment {requested} is not allowed")]
    EnvironmentDenied {
        requested: String,
        available_environments: String,
    },

    #[error("Upstream host refused by network policy: {0}")]
    PolicyDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Unsupported content type: {0}")]
    UnsupportedMediaType(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Upstream unavailable")]
    UpstreamUnavailable,

    #[error("Request timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Validation(_) | GatewayError::InvalidQuery(_) => 400,
            GatewayError::MissingToken | GatewayError::InvalidToken => 401,
            GatewayError::ScopeDenied { .. }
            | GatewayError::EnvironmentDenied { .. }
            | GatewayError::PolicyDenied(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::MethodNotAllowed(_) => 405,
            GatewayError::Conflict(_) => 409,
            GatewayError::PayloadTooLarge => 413,
            GatewayError::UnsupportedMediaType(_) => 415,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Upstream(_) => 502,
            GatewayError::UpstreamUnavailable => 503,
            GatewayError::Timeout => 504,
            _ => 500,
        }
    }

    /// Short client-facing message. Internal variants collapse to a
    /// generic message so nothing sensitive leaves the process.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Internal(_) | GatewayError::Io(_) | GatewayError::Serde(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Optional longer detail for the envelope's `errorDetail` field.
    pub fn client_detail(&self) -> Option<serde_json::Value> {
        match self {
            GatewayError::ScopeDenied {
                requested,
                available_scopes,
            } => Some(serde_json::json!({
                "requestedEndpoint": requested,
                "availableScopes": available_scopes,
            })),
            GatewayError::EnvironmentDenied {
                requested,
                available_environments,
            } => Some(serde_json::json!({
                "requestedEnvironment": requested,
                "availableEnvironments": available_environments,
            })),
            GatewayError::Validation(detail) | GatewayError::InvalidQuery(detail) => {
                Some(serde_json::Value::String(detail.clone()))
            }
            _ => None,
        }
    }

    /// The gateway error envelope:
    /// `{ "success": false, "error": ..., "errorDetail": ..., "timestamp": ... }`
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.client_message(),
            "errorDetail": self.client_detail(),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}
