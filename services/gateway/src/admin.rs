//! Admin API for credential and routing-entity management
//!
//! Served on its own listener (`server.admin_addr`) and never on the public
//! port. Responses carry credential summaries only; secrets go in, never out.
//!
//! Endpoints:
//! - GET    /admin/credentials              list credential summaries
//! - POST   /admin/credentials              add an api-key credential
//! - DELETE /admin/credentials/{id}         remove a credential
//! - PUT    /admin/credentials/{id}/active  enable or disable a credential
//! - POST   /admin/oauth/init               start a PKCE flow
//! - POST   /admin/oauth/complete           exchange the code, store the credential
//! - GET    /admin/routing-entities         list routing entities
//! - POST   /admin/routing-entities         create an entity and issue its client token
//! - GET    /admin/refresh                  refresh coordinator stats

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use common::{ProviderKind, Secret, now_millis};
use credential_pool::RefreshCoordinator;
use credential_store::{CredentialStore, NewCredential, RoutingEntity};
use oauth::OAuthClient;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ApiError;

/// Maximum age of a pending PKCE flow.
const PKCE_EXPIRY: Duration = Duration::from_secs(600);

/// Verifier for an authorization the operator has not completed yet.
struct PendingFlow {
    verifier: String,
    created_at: Instant,
}

#[derive(Clone)]
pub struct AdminState {
    store: Arc<CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
    oauth: Arc<OAuthClient>,
    flows: Arc<Mutex<HashMap<String, PendingFlow>>>,
}

impl AdminState {
    pub fn new(
        store: Arc<CredentialStore>,
        refresh: Arc<RefreshCoordinator>,
        oauth: Arc<OAuthClient>,
    ) -> Self {
        Self {
            store,
            refresh,
            oauth,
            flows: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/credentials", get(list_credentials).post(create_credential))
        .route("/admin/credentials/{id}", delete(delete_credential))
        .route("/admin/credentials/{id}/active", put(set_active))
        .route("/admin/oauth/init", post(init_oauth))
        .route("/admin/oauth/complete", post(complete_oauth))
        .route(
            "/admin/routing-entities",
            get(list_routing_entities).post(create_routing_entity),
        )
        .route("/admin/refresh", get(refresh_stats))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn entity_json(entity: &RoutingEntity) -> serde_json::Value {
    serde_json::json!({
        "id": entity.id,
        "name": entity.name,
        "credential_ids": entity.credential_ids,
        "active": entity.active,
    })
}

async fn list_credentials(State(state): State<AdminState>) -> Response {
    let credentials = state.store.list_credentials().await;
    json(StatusCode::OK, serde_json::json!({ "credentials": credentials }))
}

#[derive(Deserialize)]
struct CreateCredentialRequest {
    name: String,
    provider_kind: ProviderKind,
    secret: String,
    #[serde(default)]
    region: Option<String>,
}

/// POST /admin/credentials: store an api-key credential.
async fn create_credential(
    State(state): State<AdminState>,
    Json(body): Json<CreateCredentialRequest>,
) -> Result<Response, ApiError> {
    let mut new = NewCredential::api_key(body.name, body.provider_kind, Secret::new(body.secret));
    if let Some(region) = body.region {
        new = new.with_region(region);
    }
    let summary = state.store.create_credential(new).await?;
    info!(credential = %summary.name, id = %summary.id, "credential added");
    Ok(json(StatusCode::CREATED, serde_json::json!({ "credential": summary })))
}

async fn delete_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.store.delete_credential(&id).await?;
    info!(id, "credential removed");
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
struct SetActiveRequest {
    active: bool,
}

async fn set_active(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<SetActiveRequest>,
) -> Result<Response, ApiError> {
    state.store.set_active(&id, body.active).await?;
    info!(id, active = body.active, "credential activation changed");
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "id": id, "active": body.active }),
    ))
}

/// POST /admin/oauth/init: generate a PKCE pair and the authorization URL.
///
/// The returned `flow_id` is the OAuth `state` parameter; pass it back to
/// complete the flow.
async fn init_oauth(State(state): State<AdminState>) -> Response {
    let flow_id = oauth::generate_state();
    let verifier = oauth::generate_verifier();
    let challenge = oauth::compute_challenge(&verifier);
    let authorization_url =
        oauth::build_authorization_url(state.oauth.config(), &flow_id, &challenge);

    let mut flows = state.flows.lock().await;
    flows.retain(|_, f| f.created_at.elapsed() < PKCE_EXPIRY);
    flows.insert(
        flow_id.clone(),
        PendingFlow {
            verifier,
            created_at: Instant::now(),
        },
    );
    info!(flow_id, "oauth flow initiated");

    json(
        StatusCode::OK,
        serde_json::json!({
            "flow_id": flow_id,
            "authorization_url": authorization_url,
            "expires_in_secs": PKCE_EXPIRY.as_secs(),
        }),
    )
}

#[derive(Deserialize)]
struct CompleteOAuthRequest {
    flow_id: String,
    /// As pasted from the callback page, optionally `code#state`.
    code: String,
    name: String,
}

/// POST /admin/oauth/complete: exchange the code and store the tokens.
async fn complete_oauth(
    State(state): State<AdminState>,
    Json(body): Json<CompleteOAuthRequest>,
) -> Result<Response, ApiError> {
    let flow = state.flows.lock().await.remove(&body.flow_id);
    let flow = match flow {
        Some(flow) if flow.created_at.elapsed() < PKCE_EXPIRY => flow,
        Some(_) => {
            return Err(ApiError::InvalidRequest(
                "oauth flow expired, initiate a new one".into(),
            ));
        }
        None => {
            return Err(ApiError::InvalidRequest(format!(
                "no pending oauth flow {}",
                body.flow_id
            )));
        }
    };

    let tokens = state
        .oauth
        .exchange_code(&body.code, &flow.verifier)
        .await
        .inspect_err(|e| warn!(flow_id = %body.flow_id, error = %e, "code exchange failed"))?;

    let expires_at_ms = tokens.expires_at_ms(now_millis());
    let scopes = tokens
        .scopes()
        .unwrap_or_else(|| state.oauth.config().scopes.clone());
    let new = NewCredential::oauth(
        body.name,
        Secret::new(tokens.access_token),
        tokens.refresh_token.map(Secret::new),
        expires_at_ms,
        scopes,
    );
    let summary = state.store.create_credential(new).await?;
    info!(credential = %summary.name, id = %summary.id, "oauth credential added");
    Ok(json(StatusCode::CREATED, serde_json::json!({ "credential": summary })))
}

async fn list_routing_entities(State(state): State<AdminState>) -> Response {
    let entities: Vec<serde_json::Value> = state
        .store
        .list_routing_entities()
        .await
        .iter()
        .map(entity_json)
        .collect();
    json(StatusCode::OK, serde_json::json!({ "routing_entities": entities }))
}

#[derive(Deserialize)]
struct CreateRoutingEntityRequest {
    name: String,
    #[serde(default)]
    credential_ids: Vec<String>,
}

/// POST /admin/routing-entities: the client token is returned here only.
async fn create_routing_entity(
    State(state): State<AdminState>,
    Json(body): Json<CreateRoutingEntityRequest>,
) -> Result<Response, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::InvalidRequest("name must not be empty".into()));
    }
    let (entity, token) = state
        .store
        .create_routing_entity(&body.name, body.credential_ids)
        .await?;
    Ok(json(
        StatusCode::CREATED,
        serde_json::json!({
            "routing_entity": entity_json(&entity),
            "client_token": token.expose(),
        }),
    ))
}

async fn refresh_stats(State(state): State<AdminState>) -> Response {
    json(
        StatusCode::OK,
        serde_json::json!({
            "running": state.refresh.is_running(),
            "stats": state.refresh.stats(),
        }),
    )
}
