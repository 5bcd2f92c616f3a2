//! OAuth client configuration
//!
//! Defaults identify the public client application used for subscription
//! OAuth. None of these values are secrets; access and refresh tokens live
//! in the credential store.

use serde::Deserialize;

/// Public OAuth client ID
pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Hosted callback page that displays the authorization code
pub const DEFAULT_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// Token endpoint for code exchange and token refresh
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Authorization endpoint for Pro/Max subscriptions
pub const DEFAULT_AUTHORIZE_ENDPOINT: &str = "https://claude.ai/oauth/authorize";

/// Scopes required for inference access.
pub const DEFAULT_SCOPES: &[&str] = &["user:profile", "user:inference", "user:sessions:claude_code"];

/// Where and as whom the gateway talks OAuth.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    pub token_endpoint: String,
    pub authorize_endpoint: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            authorize_endpoint: DEFAULT_AUTHORIZE_ENDPOINT.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl OAuthConfig {
    /// Scopes as the space-separated string OAuth expects on the wire.
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_inference_scopes() {
        let config = OAuthConfig::default();
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(
            config.scope_param(),
            "user:profile user:inference user:sessions:claude_code"
        );
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: OAuthConfig = toml::from_str(
            r#"
token_endpoint = "http://127.0.0.1:9000/token"
scopes = ["user:inference"]
"#,
        )
        .unwrap();
        assert_eq!(config.token_endpoint, "http://127.0.0.1:9000/token");
        assert_eq!(config.scopes, vec!["user:inference".to_string()]);
        assert_eq!(config.redirect_uri, DEFAULT_REDIRECT_URI);
    }
}
