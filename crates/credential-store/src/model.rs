//! Credential and routing-entity records

use common::{CredentialKind, ProviderKind, Secret};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A decrypted credential row.
///
/// Secrets stay inside `Secret`, so `Debug` on this struct is safe to log.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub kind: CredentialKind,
    pub provider_kind: ProviderKind,
    /// API key, or the OAuth access token.
    pub secret: Secret<String>,
    /// OAuth refresh token.
    pub refresh_secret: Option<Secret<String>>,
    /// Access-token expiry, unix milliseconds (OAuth only).
    pub expires_at_ms: Option<u64>,
    pub scopes: Vec<String>,
    /// Cloud-runtime region for this credential.
    pub region: Option<String>,
    pub active: bool,
    pub created_at_ms: u64,
    pub last_used_at_ms: Option<u64>,
}

impl Credential {
    pub fn is_oauth(&self) -> bool {
        self.kind == CredentialKind::OAuth
    }

    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            provider_kind: self.provider_kind,
            expires_at_ms: self.expires_at_ms,
            scopes: self.scopes.clone(),
            region: self.region.clone(),
            active: self.active,
            has_refresh_secret: self.refresh_secret.is_some(),
            created_at_ms: self.created_at_ms,
            last_used_at_ms: self.last_used_at_ms,
        }
    }
}

/// Listing view of a credential. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialSummary {
    pub id: String,
    pub name: String,
    pub kind: CredentialKind,
    pub provider_kind: ProviderKind,
    pub expires_at_ms: Option<u64>,
    pub scopes: Vec<String>,
    pub region: Option<String>,
    pub active: bool,
    pub has_refresh_secret: bool,
    pub created_at_ms: u64,
    pub last_used_at_ms: Option<u64>,
}

/// Input for `CredentialStore::create_credential`.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub name: String,
    pub kind: CredentialKind,
    pub provider_kind: ProviderKind,
    pub secret: Secret<String>,
    pub refresh_secret: Option<Secret<String>>,
    pub expires_at_ms: Option<u64>,
    pub scopes: Vec<String>,
    pub region: Option<String>,
}

impl NewCredential {
    pub fn api_key(name: impl Into<String>, provider_kind: ProviderKind, key: Secret<String>) -> Self {
        Self {
            name: name.into(),
            kind: CredentialKind::ApiKey,
            provider_kind,
            secret: key,
            refresh_secret: None,
            expires_at_ms: None,
            scopes: Vec::new(),
            region: None,
        }
    }

    pub fn oauth(
        name: impl Into<String>,
        access: Secret<String>,
        refresh: Option<Secret<String>>,
        expires_at_ms: u64,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CredentialKind::OAuth,
            provider_kind: ProviderKind::Native,
            secret: access,
            refresh_secret: refresh,
            expires_at_ms: Some(expires_at_ms),
            scopes,
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Check that the secret fields match the kind.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidCredential("name must not be empty".into()));
        }
        if self.secret.expose().is_empty() {
            return Err(Error::InvalidCredential("secret must not be empty".into()));
        }
        match self.kind {
            CredentialKind::ApiKey => {
                if self.refresh_secret.is_some() || self.expires_at_ms.is_some() {
                    return Err(Error::InvalidCredential(
                        "api_key credentials carry no refresh token or expiry".into(),
                    ));
                }
            }
            CredentialKind::OAuth => {
                if self.expires_at_ms.is_none() {
                    return Err(Error::InvalidCredential(
                        "oauth credentials require an expiry".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// New OAuth token material written by a refresh.
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access: Secret<String>,
    /// `None` keeps the stored refresh token.
    pub refresh: Option<Secret<String>>,
    pub expires_at_ms: u64,
    /// `None` keeps the stored scopes.
    pub scopes: Option<Vec<String>>,
}

/// A tenant-like grouping of credentials that clients authenticate as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntity {
    pub id: String,
    pub name: String,
    /// Credentials in preference-independent stored order.
    #[serde(default)]
    pub credential_ids: Vec<String>,
    /// SHA-256 hex digests of the client tokens.
    #[serde(default)]
    pub client_token_hashes: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl RoutingEntity {
    pub fn new(name: impl Into<String>, credential_ids: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            credential_ids,
            client_token_hashes: Vec::new(),
            active: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// On-disk form of a credential: secret fields hold cipher envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredCredential {
    pub id: String,
    pub name: String,
    pub kind: CredentialKind,
    pub provider_kind: ProviderKind,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_with_refresh_is_invalid() {
        let mut cred = NewCredential::api_key("k", ProviderKind::Native, Secret::from("sk"));
        assert!(cred.validate().is_ok());
        cred.refresh_secret = Some(Secret::from("rt"));
        assert!(matches!(cred.validate(), Err(Error::InvalidCredential(_))));
    }

    #[test]
    fn oauth_requires_expiry() {
        let mut cred = NewCredential::oauth("o", Secret::from("at"), None, 1, vec![]);
        assert!(cred.validate().is_ok());
        cred.expires_at_ms = None;
        assert!(matches!(cred.validate(), Err(Error::InvalidCredential(_))));
    }

    #[test]
    fn empty_secret_is_invalid() {
        let cred = NewCredential::api_key("k", ProviderKind::Native, Secret::from(""));
        assert!(matches!(cred.validate(), Err(Error::InvalidCredential(_))));
    }

    #[test]
    fn routing_entity_defaults_active() {
        let entity: RoutingEntity = serde_json::from_str(r#"{"id":"e","name":"n"}"#).unwrap();
        assert!(entity.active);
        assert!(entity.credential_ids.is_empty());
    }
}
