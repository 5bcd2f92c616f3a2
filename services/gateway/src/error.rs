//! Client-facing error responses
//!
//! Every failure the gateway reports to a caller becomes
//! `{"error":{"type","message","request_id"}}` with a stable `type`. Upstream
//! errors are the exception: their original status and raw body are relayed
//! so clients see exactly what the upstream said.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use provider::GatewayError;
use thiserror::Error;

/// Everything a request handler can fail with.
#[derive(Error, Debug)]
pub enum ApiError {
    /// No client token, or a token that matches no routing entity.
    #[error("{0}")]
    Unauthorized(String),

    #[error(transparent)]
    Auth(#[from] credential_pool::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    TokenCount(#[from] token_count::Error),

    #[error(transparent)]
    Store(#[from] credential_store::Error),

    #[error(transparent)]
    OAuth(#[from] oauth::Error),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "authentication_error",
            ApiError::Auth(e) => e.kind(),
            ApiError::Gateway(e) => e.kind(),
            ApiError::TokenCount(token_count::Error::InvalidRequest(_)) | ApiError::InvalidRequest(_) => {
                "invalid_request_error"
            }
            ApiError::Store(credential_store::Error::NotFound(_)) => "not_found_error",
            ApiError::Store(
                credential_store::Error::DuplicateName(_)
                | credential_store::Error::InvalidCredential(_)
                | credential_store::Error::KindMismatch(_),
            ) => "invalid_request_error",
            ApiError::OAuth(e) if e.is_rejection() => "invalid_request_error",
            ApiError::OAuth(_) => "upstream_error",
            ApiError::TokenCount(_) | ApiError::Store(_) | ApiError::Internal(_) => "api_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        let code = match self {
            ApiError::Unauthorized(_) => 401,
            ApiError::Auth(e) => e.status(),
            ApiError::Gateway(e) => e.status(),
            ApiError::TokenCount(token_count::Error::InvalidRequest(_)) | ApiError::InvalidRequest(_) => 400,
            ApiError::Store(credential_store::Error::NotFound(_)) => 404,
            ApiError::Store(credential_store::Error::DuplicateName(_)) => 409,
            ApiError::Store(
                credential_store::Error::InvalidCredential(_) | credential_store::Error::KindMismatch(_),
            ) => 400,
            ApiError::OAuth(e) if e.is_rejection() => 400,
            ApiError::OAuth(_) => 502,
            ApiError::TokenCount(_) | ApiError::Store(_) | ApiError::Internal(_) => 500,
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
    }

    /// Render for a caller, tagging the body with `request_id`.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        if let ApiError::Gateway(GatewayError::Upstream { status, body, .. }) = &self
            && !body.is_empty()
        {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = (status, body.clone()).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            return response;
        }
        error_response(self.status(), self.kind(), &self.to_string(), request_id)
    }
}

/// Renders with a fresh request id, for surfaces that don't mint one per
/// request (the admin API).
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        self.into_response_with_id(&request_id)
    }
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
