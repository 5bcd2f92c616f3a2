//! Request-path facade over selection, forwarding and token counting
//!
//! HTTP handlers only translate between axum and these calls; everything
//! that decides which credential serves a request, which upstream it goes
//! to, and what gets billed lives here.

use std::sync::Arc;

use credential_pool::AccountSelector;
use credential_store::CredentialStore;
use provider::{
    AuthResult, GatewayRequest, StreamSummary, UpstreamResponse, Upstreams, Usage, UsageEvent,
};
use token_count::{CountTokensRequest, TokenCountApproximator};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::ApiError;
use crate::ledger::UsageSink;

/// What a caller presented to identify itself.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// Client token from `x-api-key` or a bearer `authorization` header.
    pub client_token: Option<String>,
    /// Credential id or name the caller pinned the request to.
    pub requested_credential: Option<String>,
}

pub struct GatewayCore {
    store: Arc<CredentialStore>,
    selector: AccountSelector,
    upstreams: Upstreams,
    approximator: TokenCountApproximator,
    ledger: Arc<dyn UsageSink>,
}

impl GatewayCore {
    pub fn new(
        store: Arc<CredentialStore>,
        selector: AccountSelector,
        upstreams: Upstreams,
        approximator: TokenCountApproximator,
        ledger: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            store,
            selector,
            upstreams,
            approximator,
            ledger,
        }
    }

    /// Resolve the caller's client token to a routing entity, then pick a
    /// credential for it.
    pub async fn authenticate(&self, ctx: &RoutingContext) -> Result<AuthResult, ApiError> {
        let token = ctx
            .client_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing client token".into()))?;
        let entity = self
            .store
            .routing_entity_by_client_token(token)
            .await
            .ok_or_else(|| ApiError::Unauthorized("invalid client token".into()))?;

        let span = info_span!("authenticate", routing_key = %entity.id);
        let auth = self
            .selector
            .authenticate(&entity.id, ctx.requested_credential.as_deref())
            .instrument(span)
            .await?;
        Ok(auth)
    }

    /// Send a request upstream through the gateway matching the credential.
    pub async fn forward(
        &self,
        request: &GatewayRequest,
        auth: &AuthResult,
    ) -> Result<UpstreamResponse, ApiError> {
        let gateway = self.upstreams.for_kind(auth.provider_kind);
        let span = info_span!(
            "forward",
            request_id = %request.request_id,
            credential = %auth.credential_name,
            upstream = gateway.id(),
        );
        let response = provider::execute(gateway, request, auth)
            .instrument(span)
            .await?;
        Ok(response)
    }

    pub async fn count_tokens(&self, request: &CountTokensRequest) -> Result<usize, ApiError> {
        Ok(self.approximator.count(request).await?)
    }

    /// Bill a completed request. Zero usage is not recorded.
    pub fn record_usage(&self, request_id: &str, auth: &AuthResult, usage: &Usage) {
        record(self.ledger.as_ref(), request_id, auth, usage);
    }

    /// Bill a streamed request once its tracker reports a summary.
    pub fn track_stream_usage(
        &self,
        request_id: String,
        auth: &AuthResult,
        summary: oneshot::Receiver<StreamSummary>,
    ) {
        let ledger = Arc::clone(&self.ledger);
        let auth = auth.clone();
        tokio::spawn(async move {
            match summary.await {
                Ok(summary) => {
                    if !summary.complete {
                        debug!(request_id, frames = summary.frames, "stream ended before its terminator");
                    }
                    record(ledger.as_ref(), &request_id, &auth, &summary.usage);
                }
                Err(_) => warn!(request_id, "stream summary dropped without being sent"),
            }
        });
    }

    /// Drop token-count flights stuck past their hard timeout.
    pub fn sweep_token_counts(&self) -> usize {
        self.approximator.sweep()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }
}

fn record(ledger: &dyn UsageSink, request_id: &str, auth: &AuthResult, usage: &Usage) {
    if usage.is_zero() {
        return;
    }
    ledger.record(UsageEvent::new(
        request_id,
        &auth.credential_id,
        &auth.routing_entity_id,
        usage,
    ));
}
