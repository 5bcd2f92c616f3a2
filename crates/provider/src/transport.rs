//! Upstream transport: hard timeouts, bounded retry, structured errors
//!
//! Only failures where the upstream cannot have accepted the request are
//! retried: connection errors and 502/503/529 responses. A timed-out request
//! may already be committed upstream, so it fails immediately.

use crate::error::{GatewayError, Result};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Bounded exponential backoff for transient upstream failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Statuses that mean the upstream did not take the request.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 529)
}

/// One fully described upstream request, re-sendable across retries.
pub struct UpstreamCall<'a> {
    pub client: &'a reqwest::Client,
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl UpstreamCall<'_> {
    /// Send with retry; returns the first 2xx response or a typed error.
    pub async fn send(self) -> Result<reqwest::Response> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_err = GatewayError::Connect("no attempt made".into());

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry.backoff(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %last_err, "retrying upstream call");
                tokio::time::sleep(delay).await;
            }

            let req = self
                .client
                .request(self.method.clone(), &self.url)
                .headers(self.headers.clone())
                .body(self.body.clone());

            let sent = tokio::time::timeout(self.timeout, req.send()).await;
            let response = match sent {
                Err(_) => return Err(GatewayError::Timeout(self.timeout)),
                Ok(Err(e)) if e.is_timeout() => return Err(GatewayError::Timeout(self.timeout)),
                Ok(Err(e)) if e.is_connect() => {
                    last_err = GatewayError::Connect(e.to_string());
                    continue;
                }
                Ok(Err(e)) => return Err(GatewayError::Connect(e.to_string())),
                Ok(Ok(resp)) => resp,
            };

            let status = response.status();
            if status.is_success() {
                debug!(status = status.as_u16(), attempt, "upstream call succeeded");
                return Ok(response);
            }

            let err = upstream_error(response, self.timeout).await;
            if is_retryable_status(status.as_u16()) {
                last_err = err;
                continue;
            }
            return Err(err);
        }

        Err(last_err)
    }
}

/// Read a non-2xx response into `GatewayError::Upstream`.
async fn upstream_error(response: reqwest::Response, timeout: Duration) -> GatewayError {
    let status = response.status().as_u16();
    let body = match tokio::time::timeout(timeout, response.text()).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => return GatewayError::Connect(format!("failed to read error body: {e}")),
        Err(_) => return GatewayError::Timeout(timeout),
    };
    let message = error_message(&body).unwrap_or_else(|| format!("upstream returned status {status}"));
    GatewayError::Upstream {
        status,
        message,
        body,
    }
}

/// Pull a human-readable message out of a structured error body.
///
/// Recognizes `{"error":{"message":..}}`, `{"message":..}` and `{"Message":..}`.
pub fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .or_else(|| value.get("Message"))
        .and_then(|m| m.as_str())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn call<'a>(client: &'a reqwest::Client, url: String, timeout: Duration) -> UpstreamCall<'a> {
        UpstreamCall {
            client,
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
            timeout,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
            },
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), MAX_BACKOFF);
    }

    #[test]
    fn error_message_shapes() {
        assert_eq!(
            error_message(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            Some("Overloaded".into())
        );
        assert_eq!(
            error_message(r#"{"message":"The security token included in the request is invalid."}"#),
            Some("The security token included in the request is invalid.".into())
        );
        assert_eq!(error_message(r#"{"Message":"throttled"}"#), Some("throttled".into()));
        assert_eq!(error_message("<html>bad gateway</html>"), None);
    }

    #[tokio::test]
    async fn retries_overloaded_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/messages",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::from_u16(529).unwrap(), r#"{"error":{"message":"Overloaded"}}"#)
                    } else {
                        (StatusCode::OK, r#"{"ok":true}"#)
                    }
                }
            }),
        );
        let base = serve(app).await;
        let client = reqwest::Client::new();

        let resp = call(&client, format!("{base}/v1/messages"), Duration::from_secs(5))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/messages",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::BAD_REQUEST,
                        r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens required"}}"#,
                    )
                }
            }),
        );
        let base = serve(app).await;
        let client = reqwest::Client::new();

        let err = call(&client, format!("{base}/v1/messages"), Duration::from_secs(5))
            .send()
            .await
            .unwrap_err();
        match err {
            GatewayError::Upstream { status, message, body } => {
                assert_eq!(status, 400);
                assert_eq!(message, "max_tokens required");
                assert!(body.contains("invalid_request_error"));
            }
            other => panic!("expected Upstream, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/messages",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    "late"
                }
            }),
        );
        let base = serve(app).await;
        let client = reqwest::Client::new();

        let err = call(&client, format!("{base}/v1/messages"), Duration::from_millis(100))
            .send()
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)), "got {err:?}");
        assert_eq!(err.kind(), "timeout_error");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_refused_exhausts_retries() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let err = call(&client, format!("http://{addr}/v1/messages"), Duration::from_secs(2))
            .send()
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Connect(_)), "got {err:?}");
        assert_eq!(err.status(), 502);
    }
}
