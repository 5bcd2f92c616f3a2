//! Fixtures shared by the service tests: a mock upstream that speaks both
//! wire contracts plus the token endpoint, and a fully wired core.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use common::{ProviderKind, Secret};
use credential_pool::{AccountSelector, RefreshCoordinator, RefreshSettings};
use credential_store::{CredentialStore, NewCredential, SecretCipher};
use oauth::{OAuthClient, OAuthConfig};
use provider::{
    CloudRuntimeGateway, CloudRuntimeSettings, NativeGateway, NativeSettings, RetryPolicy,
    Upstreams,
};
use tempfile::TempDir;
use token_count::{TokenCountApproximator, TokenCountSettings, Tokenizer};
use tokio::net::TcpListener;

use crate::admin::AdminState;
use crate::ledger::tests::CollectingSink;
use crate::proxy::AppState;
use crate::service::GatewayCore;

pub(crate) const MESSAGE_BODY: &str = r#"{"id":"msg_1","type":"message","role":"assistant","content":[{"type":"text","text":"Hello"}],"usage":{"input_tokens":10,"output_tokens":5}}"#;

pub(crate) const STREAM_BODY: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":50,\"output_tokens\":1}}}\n\n",
    "event: content_block_start\n",
    "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":12}}\n\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

const PING_ONLY_STREAM: &str = "event: ping\ndata: {\"type\":\"ping\"}\n\n";

const BAD_MODEL_BODY: &str =
    r#"{"type":"error","error":{"type":"invalid_request_error","message":"unknown model"}}"#;

/// A request as the mock upstream received it.
#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

pub(crate) struct MockUpstream {
    pub url: String,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl MockUpstream {
    /// Routes by path:
    /// - `/v1/messages` (JSON or SSE), `/v1/messages/count_tokens`
    /// - `/model/{id}/invoke` and `/model/{id}/invoke-with-response-stream`;
    ///   ids containing `empty` answer with no content and no usage
    /// - `/oauth/token`
    pub(crate) async fn start() -> Self {
        let seen: Arc<Mutex<Vec<SeenRequest>>> = Arc::new(Mutex::new(vec![]));
        let log = seen.clone();
        let app = Router::new().fallback(move |request: Request<Body>| {
            let log = log.clone();
            async move {
                let (parts, body) = request.into_parts();
                let body = axum::body::to_bytes(body, 10 * 1024 * 1024)
                    .await
                    .unwrap_or_default();
                let path = parts.uri.path().to_string();
                log.lock().unwrap().push(SeenRequest {
                    path: path.clone(),
                    headers: parts.headers,
                    body: body.to_vec(),
                });
                let json: serde_json::Value =
                    serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
                reply(&path, &json)
            }
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            seen,
        }
    }

    pub(crate) fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn last(&self) -> SeenRequest {
        self.seen().pop().expect("upstream saw no request")
    }
}

fn reply(path: &str, body: &serde_json::Value) -> Response {
    let wants_stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");
    match path {
        "/oauth/token" => json(
            StatusCode::OK,
            r#"{"access_token":"at_fresh","refresh_token":"rt_fresh","expires_in":3600,"scope":"user:inference"}"#,
        ),
        "/v1/messages/count_tokens" => json(StatusCode::OK, r#"{"input_tokens":7}"#),
        "/v1/messages" if model == "bad-model" => json(StatusCode::BAD_REQUEST, BAD_MODEL_BODY),
        "/v1/messages" if wants_stream => sse(STREAM_BODY),
        "/v1/messages" => json(StatusCode::OK, MESSAGE_BODY),
        p if p.starts_with("/model/") && p.ends_with("/invoke-with-response-stream") => {
            if p.contains("empty") {
                sse(PING_ONLY_STREAM)
            } else {
                sse(STREAM_BODY)
            }
        }
        p if p.starts_with("/model/") && p.ends_with("/invoke") => {
            if p.contains("empty") {
                json(
                    StatusCode::OK,
                    r#"{"content":[],"usage":{"input_tokens":0,"output_tokens":0}}"#,
                )
            } else {
                json(StatusCode::OK, MESSAGE_BODY)
            }
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn json(status: StatusCode, body: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn sse(body: &'static str) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        body,
    )
        .into_response()
}

/// One token per whitespace-separated word.
pub(crate) struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Store, coordinator, selector and core wired against a mock upstream.
pub(crate) struct Harness {
    pub core: Arc<GatewayCore>,
    pub store: Arc<CredentialStore>,
    pub refresh: Arc<RefreshCoordinator>,
    pub oauth: Arc<OAuthClient>,
    pub ledger: Arc<CollectingSink>,
    _dir: TempDir,
}

impl Harness {
    pub(crate) async fn new(upstream: &MockUpstream) -> Self {
        let dir = TempDir::new().unwrap();
        let cipher = SecretCipher::new(Secret::new("test-master-key-0123456789abcdefghij".to_string())).unwrap();
        let store = Arc::new(
            CredentialStore::load(dir.path().join("credentials.json"), cipher)
                .await
                .unwrap(),
        );

        let http = reqwest::Client::new();
        let oauth = Arc::new(OAuthClient::new(
            http.clone(),
            OAuthConfig {
                token_endpoint: format!("{}/oauth/token", upstream.url),
                ..OAuthConfig::default()
            },
        ));
        let refresh = Arc::new(RefreshCoordinator::new(
            store.clone(),
            oauth.clone(),
            RefreshSettings::default(),
        ));
        let selector = AccountSelector::new(store.clone(), refresh.clone());

        let retry = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
        };
        let upstreams = Upstreams::new(
            NativeGateway::new(
                http.clone(),
                NativeSettings {
                    base_url: upstream.url.clone(),
                    timeout: Duration::from_secs(5),
                    retry,
                },
            ),
            CloudRuntimeGateway::new(
                http,
                CloudRuntimeSettings {
                    base_url: Some(upstream.url.clone()),
                    timeout: Duration::from_secs(5),
                    retry,
                    ..CloudRuntimeSettings::default()
                },
            ),
        );
        let approximator =
            TokenCountApproximator::new(Arc::new(WordTokenizer), TokenCountSettings::default());
        let ledger = Arc::new(CollectingSink::default());
        let core = Arc::new(GatewayCore::new(
            store.clone(),
            selector,
            upstreams,
            approximator,
            ledger.clone(),
        ));

        Self {
            core,
            store,
            refresh,
            oauth,
            ledger,
            _dir: dir,
        }
    }

    /// Create an api-key credential and a routing entity holding only it.
    /// Returns the entity's client token and the credential id.
    pub(crate) async fn entity_with_api_key(&self, name: &str, kind: ProviderKind) -> (String, String) {
        let credential = self
            .store
            .create_credential(NewCredential::api_key(
                name,
                kind,
                Secret::new(format!("sk-{name}-secret")),
            ))
            .await
            .unwrap();
        let (_, token) = self
            .store
            .create_routing_entity(&format!("{name}-team"), vec![credential.id.clone()])
            .await
            .unwrap();
        (token.expose().clone(), credential.id)
    }

    pub(crate) fn app_state(&self) -> AppState {
        AppState {
            core: self.core.clone(),
            prometheus: metrics_exporter_prometheus::PrometheusBuilder::new()
                .build_recorder()
                .handle(),
            started_at: Instant::now(),
            max_body_bytes: 1024 * 1024,
        }
    }

    pub(crate) fn admin_state(&self) -> AdminState {
        AdminState::new(self.store.clone(), self.refresh.clone(), self.oauth.clone())
    }
}
