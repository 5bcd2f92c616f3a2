//! Credential selection and failover for a routing entity
//!
//! Candidates are ranked by rendezvous hashing: each credential scores
//! SHA-256(`routing_key:name`) as a 256-bit big-endian integer, highest
//! first, ties broken by name. The same routing key always gets the same
//! order, and different keys spread across credentials without any shared
//! counter. The first candidate that yields a usable token wins.

use std::sync::Arc;

use common::{CredentialKind, ProviderKind, now_millis};
use credential_store::{Credential, CredentialStore};
use provider::AuthResult;
use provider::headers::sensitive_value;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::refresh::RefreshCoordinator;

/// Resolves a routing entity to one authenticated credential.
pub struct AccountSelector {
    store: Arc<CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
}

impl AccountSelector {
    pub fn new(store: Arc<CredentialStore>, refresh: Arc<RefreshCoordinator>) -> Self {
        Self { store, refresh }
    }

    /// Authenticate as `routing_key`, optionally pinned to one credential
    /// (by id or name).
    pub async fn authenticate(&self, routing_key: &str, requested: Option<&str>) -> Result<AuthResult> {
        let entity = self
            .store
            .routing_entity(routing_key)
            .await
            .filter(|e| e.active)
            .ok_or_else(|| Error::RoutingEntityNotFound(routing_key.to_string()))?;

        let credentials = self.store.credentials_for_entity(&entity.id).await?;
        if credentials.is_empty() {
            return Err(Error::NoCredentialsConfigured(entity.id));
        }

        let candidates = match requested {
            Some(wanted) => {
                let pinned: Vec<Credential> = credentials
                    .into_iter()
                    .filter(|c| c.id == wanted || c.name == wanted)
                    .collect();
                if pinned.is_empty() {
                    return Err(Error::AccountNotLinked {
                        credential: wanted.to_string(),
                        routing_entity: entity.id,
                    });
                }
                pinned
            }
            None => rank_candidates(routing_key, credentials),
        };

        for credential in &candidates {
            let token = match self.refresh.current_token(credential).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(routing_key, credential = %credential.name, error = %e, "credential unusable, trying next");
                    continue;
                }
            };
            let Some(auth_headers) = auth_headers(credential, token.expose()) else {
                warn!(routing_key, credential = %credential.name, "secret is not a valid header value, trying next");
                continue;
            };

            self.touch_last_used(credential);
            debug!(routing_key, credential = %credential.name, provider = credential.provider_kind.label(), "selected credential");
            return Ok(AuthResult {
                routing_entity_id: entity.id.clone(),
                credential_id: credential.id.clone(),
                credential_name: credential.name.clone(),
                credential_kind: credential.kind,
                provider_kind: credential.provider_kind,
                region: credential.region.clone(),
                auth_headers,
            });
        }

        info!(routing_key, candidates = candidates.len(), "all candidates exhausted");
        Err(Error::NoValidCredentials(entity.id))
    }

    /// Best-effort bookkeeping; never fails the request.
    fn touch_last_used(&self, credential: &Credential) {
        let store = Arc::clone(&self.store);
        let id = credential.id.clone();
        let name = credential.name.clone();
        tokio::spawn(async move {
            if let Err(e) = store.touch_last_used(&id, now_millis()).await {
                warn!(credential = %name, error = %e, "failed to record last use");
            }
        });
    }
}

/// Order `candidates` for `routing_key`, most preferred first.
pub fn rank_candidates(routing_key: &str, candidates: Vec<Credential>) -> Vec<Credential> {
    let mut scored: Vec<([u8; 32], Credential)> = candidates
        .into_iter()
        .map(|c| (score(routing_key, &c.name), c))
        .collect();
    scored.sort_by(|(a_score, a), (b_score, b)| b_score.cmp(a_score).then_with(|| a.name.cmp(&b.name)));
    scored.into_iter().map(|(_, c)| c).collect()
}

/// Big-endian byte order compares the same as the 256-bit integer.
fn score(routing_key: &str, name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(routing_key.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    hasher.finalize().into()
}

fn auth_headers(credential: &Credential, secret: &str) -> Option<HeaderMap> {
    let mut headers = HeaderMap::new();
    match (credential.provider_kind, credential.kind) {
        (ProviderKind::Native, CredentialKind::ApiKey) => {
            headers.insert(HeaderName::from_static("x-api-key"), sensitive_value(secret)?);
        }
        _ => {
            headers.insert(AUTHORIZATION, sensitive_value(&format!("Bearer {secret}"))?);
        }
    }
    Some(headers)
}
