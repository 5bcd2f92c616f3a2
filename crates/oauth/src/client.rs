//! OAuth token exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (initial OAuth flow completion)
//! 2. Token refresh (driven by the refresh coordinator)
//!
//! Both operations POST a form to the configured token endpoint with
//! different grant types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::OAuthConfig;
use crate::error::{Error, Result};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. Use
/// `expires_at_ms` to turn it into an absolute unix millisecond timestamp.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Absent when the endpoint keeps the existing refresh token valid.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    /// Space-separated granted scopes, when the endpoint reports them.
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    pub fn expires_at_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_add(self.expires_in.saturating_mul(1000))
    }

    pub fn scopes(&self) -> Option<Vec<String>> {
        self.scope
            .as_ref()
            .map(|s| s.split_whitespace().map(str::to_owned).collect())
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Token endpoint client.
#[derive(Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    config: OAuthConfig,
    timeout: Duration,
}

impl OAuthClient {
    pub fn new(http: reqwest::Client, config: OAuthConfig) -> Self {
        Self {
            http,
            config,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Exchange an authorization code for tokens (initial OAuth flow).
    ///
    /// The user has authorized in their browser and pasted back the code.
    /// The PKCE verifier proves this gateway initiated the flow. Codes copied
    /// from the hosted callback page arrive as `code#state`; the fragment is
    /// split off and sent as `state`.
    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenResponse> {
        let (code, state) = code.split_once('#').unwrap_or((code, ""));
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];
        if !state.is_empty() {
            form.push(("state", state));
        }
        debug!(endpoint = %self.config.token_endpoint, "exchanging authorization code");
        self.post_form(&form, "token exchange").await
    }

    /// Refresh an access token using a refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        debug!(endpoint = %self.config.token_endpoint, "refreshing access token");
        self.post_form(&form, "token refresh").await
    }

    async fn post_form(&self, form: &[(&str, &str)], what: &str) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.config.token_endpoint)
            .timeout(self.timeout)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{what} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403, or an invalid_grant 400, means the grant itself is dead
            if status.as_u16() == 401 || status.as_u16() == 403 || body.contains("invalid_grant") {
                warn!(status = status.as_u16(), "{what} rejected by token endpoint");
                return Err(Error::InvalidCredentials(format!(
                    "{what} rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "{what} returned {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid {what} response: {e}")))
    }
}
