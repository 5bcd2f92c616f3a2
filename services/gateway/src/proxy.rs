//! Public HTTP surface
//!
//! Client requests authenticate with a gateway client token (`x-api-key` or
//! a bearer `authorization` header), optionally pin a credential with
//! `x-gateway-credential`, and are forwarded to whichever upstream serves
//! the winning credential. Every response carries `x-request-id`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::ProviderKind;
use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use provider::{GatewayError, GatewayRequest, UpstreamResponse};
use token_count::CountTokensRequest;
use tracing::{Instrument, info, info_span, warn};

use crate::service::{GatewayCore, RoutingContext};
use crate::error::ApiError;
use crate::metrics;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const PINNED_CREDENTIAL: HeaderName = HeaderName::from_static("x-gateway-credential");
const API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Shared state for the public listener.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<GatewayCore>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
    pub max_body_bytes: usize,
}

/// Build the public router.
///
/// The concurrency limit layer caps requests in flight at `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Read the caller's client token and optional credential pin.
pub fn routing_context(headers: &HeaderMap) -> RoutingContext {
    let text = |name: &HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty());

    RoutingContext {
        client_token: text(&API_KEY).or(bearer),
        requested_credential: text(&PINNED_CREDENTIAL),
    }
}

/// POST /v1/messages
async fn messages_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let method = request.method().to_string();
    let span = info_span!("messages", request_id = %request_id);

    let response = handle_messages(&state, request, &request_id)
        .instrument(span)
        .await
        .unwrap_or_else(|e| failure(e, &request_id));
    finish(response, &request_id, &method, "messages", started)
}

async fn handle_messages(
    state: &AppState,
    request: Request<Body>,
    request_id: &str,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let body = read_body(body, state.max_body_bytes).await?;
    let auth = state.core.authenticate(&routing_context(&parts.headers)).await?;

    let upstream_request = gateway_request(parts, request_id, body);

    match state.core.forward(&upstream_request, &auth).await? {
        UpstreamResponse::Complete(complete) => {
            state.core.record_usage(request_id, &auth, &complete.usage);
            info!(
                credential = %auth.credential_name,
                status = complete.status.as_u16(),
                input_tokens = complete.usage.input_tokens,
                output_tokens = complete.usage.output_tokens,
                "request completed"
            );
            let mut response = Response::new(Body::from(complete.body));
            *response.status_mut() = complete.status;
            *response.headers_mut() = complete.headers;
            Ok(response)
        }
        UpstreamResponse::Streaming(streaming) => {
            state
                .core
                .track_stream_usage(request_id.to_string(), &auth, streaming.summary);
            info!(credential = %auth.credential_name, status = streaming.status.as_u16(), "streaming response");

            let body = streaming.body.map(|item| {
                Ok::<Bytes, Infallible>(match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        metrics::record_upstream_error(e.kind());
                        warn!(error = %e, "upstream stream failed");
                        error_frame(&e)
                    }
                })
            });
            let mut response = Response::new(Body::from_stream(body));
            *response.status_mut() = streaming.status;
            *response.headers_mut() = streaming.headers;
            Ok(response)
        }
    }
}

/// POST /v1/messages/count_tokens
///
/// Native credentials ask the upstream; the cloud runtime has no counting
/// endpoint, so its credentials get a local approximation.
async fn count_tokens_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let method = request.method().to_string();
    let span = info_span!("count_tokens", request_id = %request_id);

    let response = handle_count_tokens(&state, request, &request_id)
        .instrument(span)
        .await
        .unwrap_or_else(|e| failure(e, &request_id));
    finish(response, &request_id, &method, "count_tokens", started)
}

async fn handle_count_tokens(
    state: &AppState,
    request: Request<Body>,
    request_id: &str,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let body = read_body(body, state.max_body_bytes).await?;
    let count_request = CountTokensRequest::from_json(&body)?;
    let auth = state.core.authenticate(&routing_context(&parts.headers)).await?;

    if auth.provider_kind == ProviderKind::CloudRuntime {
        let input_tokens = state.core.count_tokens(&count_request).await?;
        return Ok(json_response(
            StatusCode::OK,
            serde_json::json!({ "input_tokens": input_tokens }),
        ));
    }

    let upstream_request = gateway_request(parts, request_id, body);
    match state.core.forward(&upstream_request, &auth).await? {
        UpstreamResponse::Complete(complete) => {
            let mut response = Response::new(Body::from(complete.body));
            *response.status_mut() = complete.status;
            *response.headers_mut() = complete.headers;
            Ok(response)
        }
        UpstreamResponse::Streaming(_) => Err(ApiError::Gateway(GatewayError::Malformed(
            "count_tokens answered with a stream".into(),
        ))),
    }
}

fn gateway_request(parts: axum::http::request::Parts, request_id: &str, body: Bytes) -> GatewayRequest {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    GatewayRequest {
        request_id: request_id.to_string(),
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
    }
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, ApiError> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("failed to read request body: {e}")))
}

/// Log and count a failed request, then render it.
fn failure(error: ApiError, request_id: &str) -> Response {
    match &error {
        ApiError::Unauthorized(_) | ApiError::Auth(_) => {
            metrics::record_auth_failure(error.kind());
            warn!(error = %error, "authentication failed");
        }
        ApiError::Gateway(e) => {
            metrics::record_upstream_error(e.kind());
            warn!(error = %e, "upstream request failed");
        }
        _ => warn!(error = %error, "request failed"),
    }
    error.into_response_with_id(request_id)
}

fn finish(
    mut response: Response,
    request_id: &str,
    method: &str,
    route: &'static str,
    started: Instant,
) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    metrics::record_request(
        response.status().as_u16(),
        method,
        route,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// In-band SSE error event for failures after the response has started.
fn error_frame(error: &GatewayError) -> Bytes {
    let payload = serde_json::json!({
        "type": "error",
        "error": {
            "type": error.kind(),
            "message": error.to_string(),
        }
    });
    Bytes::from(format!("event: error\ndata: {payload}\n\n"))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Response {
    let credentials = state.core.store().list_credentials().await;
    let active = credentials.iter().filter(|c| c.active).count();
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "credentials": credentials.len(),
            "active_credentials": active,
        }),
    )
}

/// GET /metrics in Prometheus text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}
