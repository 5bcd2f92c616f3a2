//! Native upstream gateway
//!
//! Forwards method, path, query and body near-verbatim to the native messages
//! API. Caller credentials are stripped and replaced by the resolved
//! credential's headers. OAuth credentials additionally get the
//! `anthropic-beta` flags their authentication needs.

use crate::error::GatewayError;
use crate::headers::{self, ANTHROPIC_BETA, ANTHROPIC_VERSION};
use crate::stream::TrackedStream;
use crate::transport::{RetryPolicy, UpstreamCall};
use crate::usage::Usage;
use crate::{
    AuthResult, CredentialKind, Gateway, GatewayFuture, GatewayRequest, ProcessedResponse,
    StreamingResponse,
};
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;
use tracing::{Instrument, debug, info_span, warn};

/// Beta flags OAuth-authenticated requests must carry, merged with the
/// caller's own.
pub const REQUIRED_BETA_FLAGS: &[&str] = &[
    "oauth-2025-04-20",
    "interleaved-thinking-2025-05-14",
    "context-management-2025-06-27",
];

/// API version header value used when the caller sends none.
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct NativeSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for NativeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct NativeGateway {
    client: reqwest::Client,
    settings: NativeSettings,
}

impl NativeGateway {
    pub fn new(client: reqwest::Client, settings: NativeSettings) -> Self {
        Self { client, settings }
    }

    /// Headers as they will be sent upstream.
    fn prepare_headers(&self, request: &GatewayRequest, auth: &AuthResult) -> HeaderMap {
        let mut headers = headers::filter_request_headers(&request.headers);
        if auth.credential_kind == CredentialKind::OAuth {
            merge_beta_flags(&mut headers);
        }
        if !headers.contains_key(ANTHROPIC_VERSION) {
            headers.insert(ANTHROPIC_VERSION, HeaderValue::from_static(DEFAULT_API_VERSION));
        }
        headers::apply_auth_headers(&mut headers, &auth.auth_headers);
        headers
    }
}

impl Gateway for NativeGateway {
    fn id(&self) -> &str {
        "native"
    }

    fn forward<'a>(
        &'a self,
        request: &'a GatewayRequest,
        auth: &'a AuthResult,
    ) -> GatewayFuture<'a, reqwest::Response> {
        let span = info_span!("native_forward", request_id = %request.request_id, credential = %auth.credential_name);
        Box::pin(async move {
            let headers = self.prepare_headers(request, auth);
            let url = format!(
                "{}{}",
                self.settings.base_url.trim_end_matches('/'),
                request.path_and_query
            );
            debug!(url = %url, "forwarding to native upstream");
            UpstreamCall {
                client: &self.client,
                method: request.method.clone(),
                url,
                headers,
                body: request.body.clone(),
                timeout: self.settings.timeout,
                retry: self.settings.retry,
            }
            .send()
            .await
        }
        .instrument(span))
    }

    fn process_response(&self, response: reqwest::Response) -> GatewayFuture<'_, ProcessedResponse> {
        Box::pin(async move {
            let status = response.status();
            let headers = headers::filter_response_headers(response.headers());
            let body = tokio::time::timeout(self.settings.timeout, response.bytes())
                .await
                .map_err(|_| GatewayError::Timeout(self.settings.timeout))?
                .map_err(|e| GatewayError::Connect(format!("failed to read upstream body: {e}")))?;

            let usage = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("usage").map(Usage::from_json))
                .unwrap_or_default();

            Ok(ProcessedResponse {
                status,
                headers,
                body,
                usage,
            })
        })
    }

    fn process_stream(&self, response: reqwest::Response) -> StreamingResponse {
        let status = response.status();
        let headers = headers::filter_response_headers(response.headers());
        let (body, summary) = TrackedStream::from_response(response, false);
        StreamingResponse {
            status,
            headers,
            body,
            summary,
        }
    }
}

/// Put the required beta flags first, then the caller's, each once.
pub fn merge_beta_flags(headers: &mut HeaderMap) {
    let mut flags: Vec<&str> = REQUIRED_BETA_FLAGS.to_vec();
    let caller: Vec<String> = headers
        .get_all(&ANTHROPIC_BETA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|flag| flag.trim().to_string())
        .filter(|flag| !flag.is_empty())
        .collect();
    for flag in &caller {
        if !flags.contains(&flag.as_str()) {
            flags.push(flag);
        }
    }

    match HeaderValue::from_str(&flags.join(",")) {
        Ok(value) => {
            headers.insert(ANTHROPIC_BETA, value);
        }
        Err(e) => warn!(error = %e, "dropping unrepresentable anthropic-beta value"),
    }
}
