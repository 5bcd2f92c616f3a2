//! Error types for upstream forwarding

use std::time::Duration;

/// Errors from forwarding a request upstream or processing its response.
///
/// `Clone` so a terminal stream error can be both logged and yielded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Non-2xx upstream response. `body` is the raw upstream body so callers
    /// can relay it unchanged.
    #[error("upstream returned {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        body: String,
    },

    /// 2xx response carrying neither content nor usage.
    #[error("upstream returned an empty response (no content and no usage)")]
    EmptyResponse,

    #[error("upstream returned a malformed response: {0}")]
    Malformed(String),

    #[error("upstream request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Stable discriminator for user-visible error bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Upstream { .. }
            | GatewayError::EmptyResponse
            | GatewayError::Malformed(_)
            | GatewayError::Connect(_) => "upstream_error",
            GatewayError::Timeout(_) => "timeout_error",
            GatewayError::InvalidRequest(_) => "invalid_request_error",
        }
    }

    /// HTTP status to report to the caller.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::EmptyResponse
            | GatewayError::Malformed(_)
            | GatewayError::Connect(_) => 502,
            GatewayError::Timeout(_) => 504,
            GatewayError::InvalidRequest(_) => 400,
        }
    }
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
