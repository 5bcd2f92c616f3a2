//! Cloud-runtime upstream gateway
//!
//! The cloud runtime serves the same models behind a different contract:
//! the model id travels in the URL path, the host is region-scoped, and the
//! body carries a version marker instead of `model`/`stream` fields.
//!
//! Region resolution priority: a geography prefix on the model id
//! (`us.`, `eu.`, `apac.`) > the credential's region > the configured default.

use crate::error::GatewayError;
use crate::headers;
use crate::stream::TrackedStream;
use crate::transport::{RetryPolicy, UpstreamCall};
use crate::usage::inspect_message;
use crate::{
    AuthResult, Gateway, GatewayFuture, GatewayRequest, ProcessedResponse, StreamingResponse,
};
use bytes::Bytes;
use reqwest::Method;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{Instrument, debug, info_span, warn};

/// Version marker the cloud runtime requires in every body.
pub const RUNTIME_API_VERSION: &str = "bedrock-2023-05-31";

pub const DEFAULT_REGION: &str = "us-east-1";

/// Canonical model name to runtime model id.
const BUILTIN_MODELS: &[(&str, &str)] = &[
    ("claude-3-haiku-20240307", "anthropic.claude-3-haiku-20240307-v1:0"),
    ("claude-3-5-haiku-20241022", "anthropic.claude-3-5-haiku-20241022-v1:0"),
    ("claude-3-5-sonnet-20241022", "anthropic.claude-3-5-sonnet-20241022-v2:0"),
    ("claude-3-7-sonnet-20250219", "anthropic.claude-3-7-sonnet-20250219-v1:0"),
    ("claude-sonnet-4-20250514", "anthropic.claude-sonnet-4-20250514-v1:0"),
    ("claude-sonnet-4-5-20250929", "anthropic.claude-sonnet-4-5-20250929-v1:0"),
    ("claude-opus-4-20250514", "anthropic.claude-opus-4-20250514-v1:0"),
    ("claude-opus-4-1-20250805", "anthropic.claude-opus-4-1-20250805-v1:0"),
    ("claude-haiku-4-5-20251001", "anthropic.claude-haiku-4-5-20251001-v1:0"),
];

/// Geography prefixes and the region each one routes to.
const GEO_PREFIXES: &[(&str, &str)] = &[
    ("us", "us-east-1"),
    ("eu", "eu-central-1"),
    ("apac", "ap-northeast-1"),
];

#[derive(Debug, Clone)]
pub struct CloudRuntimeSettings {
    /// Override for the runtime endpoint; `{region}` is substituted.
    pub base_url: Option<String>,
    pub default_region: String,
    /// Extra canonical-name to runtime-id mappings, consulted before the
    /// built-in table.
    pub models: HashMap<String, String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CloudRuntimeSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            default_region: DEFAULT_REGION.to_string(),
            models: HashMap::new(),
            timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// A model name translated for the cloud runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub model_id: String,
    pub region: String,
}

pub struct CloudRuntimeGateway {
    client: reqwest::Client,
    settings: CloudRuntimeSettings,
}

impl CloudRuntimeGateway {
    pub fn new(client: reqwest::Client, settings: CloudRuntimeSettings) -> Self {
        Self { client, settings }
    }

    /// Translate a canonical model name and pick the region to call.
    ///
    /// Unknown names are passed through unchanged so new runtime ids work
    /// without a table update.
    pub fn resolve_model(&self, model: &str, credential_region: Option<&str>) -> ResolvedModel {
        let (geo, base) = split_geo_prefix(model);

        let mapped = self
            .settings
            .models
            .get(base)
            .map(String::as_str)
            .or_else(|| {
                BUILTIN_MODELS
                    .iter()
                    .find(|(name, _)| *name == base)
                    .map(|(_, id)| *id)
            });
        let id = match mapped {
            Some(id) => id.to_string(),
            None => {
                debug!(model = base, "no runtime mapping, passing model id through");
                base.to_string()
            }
        };

        let model_id = match geo {
            Some((prefix, _)) => format!("{prefix}.{id}"),
            None => id,
        };
        let region = geo
            .map(|(_, region)| region.to_string())
            .or_else(|| credential_region.filter(|r| !r.is_empty()).map(str::to_owned))
            .unwrap_or_else(|| self.settings.default_region.clone());

        ResolvedModel { model_id, region }
    }

    /// Invoke URL for a resolved model.
    pub fn invoke_url(&self, resolved: &ResolvedModel, stream: bool) -> String {
        let base = match &self.settings.base_url {
            Some(url) => url.replace("{region}", &resolved.region),
            None => format!("https://bedrock-runtime.{}.amazonaws.com", resolved.region),
        };
        let action = if stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        format!(
            "{}/model/{}/{action}",
            base.trim_end_matches('/'),
            urlencoding::encode(&resolved.model_id)
        )
    }
}

impl Gateway for CloudRuntimeGateway {
    fn id(&self) -> &str {
        "cloud_runtime"
    }

    fn forward<'a>(
        &'a self,
        request: &'a GatewayRequest,
        auth: &'a AuthResult,
    ) -> GatewayFuture<'a, reqwest::Response> {
        let span = info_span!("cloud_runtime_forward", request_id = %request.request_id, credential = %auth.credential_name);
        Box::pin(
            async move {
                let mut body: serde_json::Value = serde_json::from_slice(&request.body)
                    .map_err(|e| GatewayError::InvalidRequest(format!("request body is not JSON: {e}")))?;
                let model = body
                    .get("model")
                    .and_then(|m| m.as_str())
                    .ok_or_else(|| GatewayError::InvalidRequest("missing model".into()))?
                    .to_string();
                let stream = request.wants_stream();

                let resolved = self.resolve_model(&model, auth.region.as_deref());
                let url = self.invoke_url(&resolved, stream);
                transform_body(&mut body);

                let mut headers = headers::filter_request_headers(&request.headers);
                headers.remove("anthropic-version");
                headers::apply_auth_headers(&mut headers, &auth.auth_headers);

                let body = serde_json::to_vec(&body)
                    .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
                debug!(model = %model, model_id = %resolved.model_id, region = %resolved.region, stream, "forwarding to cloud runtime");

                UpstreamCall {
                    client: &self.client,
                    method: Method::POST,
                    url,
                    headers,
                    body: Bytes::from(body),
                    timeout: self.settings.timeout,
                    retry: self.settings.retry,
                }
                .send()
                .await
            }
            .instrument(span),
        )
    }

    fn process_response(&self, response: reqwest::Response) -> GatewayFuture<'_, ProcessedResponse> {
        Box::pin(async move {
            let status = response.status();
            let headers = headers::filter_response_headers(response.headers());
            let body = tokio::time::timeout(self.settings.timeout, response.bytes())
                .await
                .map_err(|_| GatewayError::Timeout(self.settings.timeout))?
                .map_err(|e| GatewayError::Connect(format!("failed to read upstream body: {e}")))?;

            let json: serde_json::Value = serde_json::from_slice(&body)
                .map_err(|e| GatewayError::Malformed(format!("response is not JSON: {e}")))?;
            let (usage, has_content) = inspect_message(&json);
            if usage.is_zero() && !has_content {
                warn!(status = status.as_u16(), "cloud runtime returned neither content nor usage");
                return Err(GatewayError::EmptyResponse);
            }

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
        let (body, summary) = TrackedStream::from_response(response, true);
        StreamingResponse {
            status,
            headers,
            body,
            summary,
        }
    }
}

/// Rewrite a messages body for the runtime: drop `model` and `stream`, add
/// the version marker when absent.
pub fn transform_body(body: &mut serde_json::Value) {
    if let Some(obj) = body.as_object_mut() {
        obj.remove("model");
        obj.remove("stream");
        obj.entry("anthropic_version")
            .or_insert_with(|| serde_json::Value::String(RUNTIME_API_VERSION.to_string()));
    }
}

fn split_geo_prefix(model: &str) -> (Option<(&'static str, &'static str)>, &str) {
    for (prefix, region) in GEO_PREFIXES {
        if let Some(rest) = model
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('.'))
        {
            return (Some((*prefix, *region)), rest);
        }
    }
    (None, model)
}
