//! Protocol gateway abstraction for upstream LLM APIs
//!
//! Defines the `Gateway` trait that decouples the request path from the wire
//! contract of a particular upstream. Two implementations exist, selected by
//! the winning credential's `ProviderKind`:
//!
//! - `NativeGateway` forwards near-verbatim to the native messages API
//! - `CloudRuntimeGateway` translates to the cloud runtime's invoke contract
//!   (model id in the URL path, region-scoped host, version marker in the body)
//!
//! Both share the transport rules in `transport` (hard timeout, bounded retry
//! of transient failures, structured upstream errors) and the stream tracker
//! in `stream` (byte-faithful pass-through with incremental usage parsing).

pub mod cloud_runtime;
pub mod error;
pub mod headers;
pub mod native;
pub mod stream;
pub mod transport;
pub mod usage;

pub use cloud_runtime::{CloudRuntimeGateway, CloudRuntimeSettings, ResolvedModel};
pub use error::{GatewayError, Result};
pub use native::{NativeGateway, NativeSettings};
pub use stream::{FrameParser, StreamSummary, TrackedStream};
pub use transport::RetryPolicy;
pub use usage::{Usage, UsageEvent};

pub use common::{CredentialKind, ProviderKind};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::oneshot;

/// Outcome of a successful authentication: which credential won and the
/// headers that authenticate a request with it.
///
/// Header values carrying secrets are marked sensitive, so `Debug` output of
/// this struct does not leak them.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub routing_entity_id: String,
    pub credential_id: String,
    pub credential_name: String,
    pub credential_kind: CredentialKind,
    pub provider_kind: ProviderKind,
    /// Cloud-runtime region configured on the credential, if any.
    pub region: Option<String>,
    pub auth_headers: HeaderMap,
}

/// An inbound request, already read into memory, ready to forward.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub request_id: String,
    pub method: Method,
    /// Path and query, e.g. `/v1/messages?beta=true`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayRequest {
    /// Whether the caller asked for a streamed response (`"stream": true`).
    pub fn wants_stream(&self) -> bool {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
            .unwrap_or(false)
    }
}

/// A fully buffered upstream response with its extracted usage.
#[derive(Debug)]
pub struct ProcessedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub usage: Usage,
}

/// A streamed upstream response. `summary` resolves once the stream
/// finalizes (terminator, end of stream, or the body being dropped).
pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: TrackedStream,
    pub summary: oneshot::Receiver<StreamSummary>,
}

/// Either shape of upstream response.
pub enum UpstreamResponse {
    Complete(ProcessedResponse),
    Streaming(StreamingResponse),
}

/// Boxed future alias used by the dyn-compatible trait methods.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Abstraction over an upstream wire contract.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`&dyn Gateway`).
pub trait Gateway: Send + Sync {
    /// Identifier for logging and metrics (e.g. "native", "cloud_runtime")
    fn id(&self) -> &str;

    /// Build and send the upstream request using the resolved credential.
    ///
    /// Non-2xx responses are turned into `GatewayError::Upstream`; only
    /// successful responses are returned.
    fn forward<'a>(
        &'a self,
        request: &'a GatewayRequest,
        auth: &'a AuthResult,
    ) -> GatewayFuture<'a, reqwest::Response>;

    /// Buffer a whole response and extract usage from it.
    fn process_response(&self, response: reqwest::Response) -> GatewayFuture<'_, ProcessedResponse>;

    /// Wrap a streamed response in a usage-tracking pass-through.
    fn process_stream(&self, response: reqwest::Response) -> StreamingResponse;
}

/// Forward a request and process the response in whichever shape it came back.
pub async fn execute(
    gateway: &dyn Gateway,
    request: &GatewayRequest,
    auth: &AuthResult,
) -> Result<UpstreamResponse> {
    let response = gateway.forward(request, auth).await?;
    if request.wants_stream() || headers::is_event_stream(response.headers()) {
        Ok(UpstreamResponse::Streaming(gateway.process_stream(response)))
    } else {
        Ok(UpstreamResponse::Complete(
            gateway.process_response(response).await?,
        ))
    }
}

/// The two gateways, dispatched by provider kind.
pub struct Upstreams {
    native: NativeGateway,
    cloud_runtime: CloudRuntimeGateway,
}

impl Upstreams {
    pub fn new(native: NativeGateway, cloud_runtime: CloudRuntimeGateway) -> Self {
        Self {
            native,
            cloud_runtime,
        }
    }

    pub fn for_kind(&self, kind: ProviderKind) -> &dyn Gateway {
        match kind {
            ProviderKind::Native => &self.native,
            ProviderKind::CloudRuntime => &self.cloud_runtime,
        }
    }
}
