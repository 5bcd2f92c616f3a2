//! OAuth refresh coordination
//!
//! Per credential: `idle → refreshing → {idle | cooldown} → idle`.
//!
//! - A credential is due once `now + buffer >= expires_at`.
//! - While refreshing, new callers attach to the in-flight result instead of
//!   issuing a second token-endpoint call.
//! - A failure is cached for the cooldown window; callers in that window get
//!   `RefreshError::CoolingDown` with the cached reason and no upstream call.
//!   A new flight checks the cooldown again before calling upstream.
//! - The refresh itself runs as a detached task holding the credential's row
//!   lock. It re-reads the row first and skips the upstream call when another
//!   writer already refreshed it.
//!
//! The sweep task drops in-flight markers older than the hard timeout and
//! prunes expired cooldown entries.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::{Role, Secret, SingleFlight, now_millis};
use credential_store::{Credential, CredentialStore, TokenUpdate};
use oauth::{OAuthClient, TokenResponse};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::RefreshError;

/// Boxed future returned by `TokenExchanger`.
pub type ExchangeFuture<'a> = Pin<Box<dyn Future<Output = oauth::Result<TokenResponse>> + Send + 'a>>;

/// The refresh-token grant against the token endpoint.
pub trait TokenExchanger: Send + Sync {
    fn exchange_refresh_token<'a>(&'a self, refresh_token: &'a str) -> ExchangeFuture<'a>;
}

impl TokenExchanger for OAuthClient {
    fn exchange_refresh_token<'a>(&'a self, refresh_token: &'a str) -> ExchangeFuture<'a> {
        Box::pin(self.refresh(refresh_token))
    }
}

/// Refresh timing tunables.
#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    /// Refresh this long before expiry, absorbing clock skew.
    pub buffer: Duration,
    /// How long a failure suppresses further attempts.
    pub cooldown: Duration,
    /// In-flight markers older than this are swept.
    pub in_flight_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            buffer: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
            in_flight_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl RefreshSettings {
    /// Whether `credential` needs a refresh at `now_ms`. Never true for
    /// API keys or credentials without an expiry.
    pub fn is_due(&self, credential: &Credential, now_ms: u64) -> bool {
        credential.is_oauth()
            && credential
                .expires_at_ms
                .is_some_and(|expires| now_ms.saturating_add(self.buffer.as_millis() as u64) >= expires)
    }
}

/// Point-in-time coordinator statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub concurrent_attaches: u64,
    pub cooldown_rejections: u64,
    pub in_flight: usize,
    pub cooling_down: usize,
    pub average_duration_ms: f64,
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepOutcome {
    pub stale_flights: usize,
    pub expired_cooldowns: usize,
}

struct NegativeEntry {
    reason: RefreshError,
    recorded_at: Instant,
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    concurrent_attaches: AtomicU64,
    cooldown_rejections: AtomicU64,
    total_duration_micros: AtomicU64,
}

type RefreshOutcome = Result<Secret<String>, RefreshError>;

struct Inner {
    store: Arc<CredentialStore>,
    exchanger: Arc<dyn TokenExchanger>,
    settings: RefreshSettings,
    flights: SingleFlight<String, RefreshOutcome>,
    negative: Mutex<HashMap<String, NegativeEntry>>,
    counters: Counters,
}

/// Single-flight refresh controller with a negative cache.
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        exchanger: Arc<dyn TokenExchanger>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                exchanger,
                settings,
                flights: SingleFlight::new(),
                negative: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.inner.settings
    }

    /// A usable secret for `credential`, refreshing first if it is due.
    ///
    /// API keys and OAuth tokens that aren't due return the stored secret
    /// without touching the coordinator's state.
    pub async fn current_token(&self, credential: &Credential) -> Result<Secret<String>, RefreshError> {
        if !self.inner.settings.is_due(credential, now_millis()) {
            return Ok(credential.secret.clone());
        }

        if let Some(reason) = self.inner.cooling_down(&credential.id) {
            return Err(self.inner.reject_cooling(&credential.name, reason));
        }

        let inner = Arc::clone(&self.inner);
        let id = credential.id.clone();
        let name = credential.name.clone();
        let (result, role) = self
            .inner
            .flights
            .run(credential.id.clone(), async move { inner.refresh(id, name).await })
            .await;

        if role == Role::Follower {
            self.inner
                .counters
                .concurrent_attaches
                .fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_refresh_concurrent_attaches_total").increment(1);
            debug!(credential = %credential.name, "attached to in-flight refresh");
        }

        result.unwrap_or_else(|aborted| Err(RefreshError::Aborted(aborted.0)))
    }

    /// Drop stale in-flight markers and expired cooldown entries.
    pub fn sweep(&self) -> SweepOutcome {
        self.inner.sweep()
    }

    /// Spawn the periodic sweep. Calling it again replaces the running task.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.settings.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; nothing to sweep yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.sweep();
            }
        });
        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "refresh sweep started");
    }

    /// Stop the periodic sweep.
    pub fn stop(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!("refresh sweep stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn stats(&self) -> RefreshStats {
        let c = &self.inner.counters;
        let successes = c.successes.load(Ordering::Relaxed);
        let failures = c.failures.load(Ordering::Relaxed);
        let completed = successes + failures;
        let average_duration_ms = if completed == 0 {
            0.0
        } else {
            c.total_duration_micros.load(Ordering::Relaxed) as f64 / completed as f64 / 1000.0
        };
        RefreshStats {
            attempts: c.attempts.load(Ordering::Relaxed),
            successes,
            failures,
            concurrent_attaches: c.concurrent_attaches.load(Ordering::Relaxed),
            cooldown_rejections: c.cooldown_rejections.load(Ordering::Relaxed),
            in_flight: self.inner.flights.len(),
            cooling_down: self.inner.negative_len(),
            average_duration_ms,
        }
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn cooling_down(&self, id: &str) -> Option<RefreshError> {
        let negative = self.negative.lock().unwrap_or_else(PoisonError::into_inner);
        negative
            .get(id)
            .filter(|entry| entry.recorded_at.elapsed() < self.settings.cooldown)
            .map(|entry| entry.reason.clone())
    }

    fn reject_cooling(&self, name: &str, reason: RefreshError) -> RefreshError {
        self.counters
            .cooldown_rejections
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_refresh_cooldown_rejections_total").increment(1);
        debug!(credential = %name, %reason, "refresh suppressed by cooldown");
        RefreshError::CoolingDown {
            reason: reason.to_string(),
        }
    }

    fn negative_len(&self) -> usize {
        self.negative
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn refresh(&self, id: String, name: String) -> RefreshOutcome {
        // A flight that failed may have finished between the caller's
        // cooldown check and this flight's registration.
        if let Some(reason) = self.cooling_down(&id) {
            return Err(self.reject_cooling(&name, reason));
        }

        let span = info_span!("refresh", credential = %name);
        let started = Instant::now();
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_refresh_attempts_total").increment(1);

        let result = self.refresh_locked(&id, &name).instrument(span).await;

        let elapsed = started.elapsed();
        self.counters
            .total_duration_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        metrics::histogram!("gateway_refresh_duration_seconds").record(elapsed.as_secs_f64());

        match &result {
            Ok(_) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_refresh_successes_total").increment(1);
                self.negative
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_refresh_failures_total", "reason" => e.label())
                    .increment(1);
                warn!(credential = %name, error = %e, "token refresh failed, cooling down");
                self.negative
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        id,
                        NegativeEntry {
                            reason: e.clone(),
                            recorded_at: Instant::now(),
                        },
                    );
            }
        }
        result
    }

    async fn refresh_locked(&self, id: &str, name: &str) -> RefreshOutcome {
        let lock = self.store.lock_credential(id).await.map_err(store_error)?;
        let current = lock.current().await.map_err(store_error)?;
        if !current.is_oauth() {
            return Err(RefreshError::NotOAuth);
        }
        if !self.settings.is_due(&current, now_millis()) {
            debug!(credential = %name, "already refreshed by another writer");
            return Ok(current.secret);
        }
        let refresh_token = current
            .refresh_secret
            .ok_or(RefreshError::MissingRefreshToken)?;

        let response = self
            .exchanger
            .exchange_refresh_token(refresh_token.expose())
            .await
            .map_err(|e| {
                if e.is_rejection() {
                    RefreshError::Rejected(e.to_string())
                } else {
                    RefreshError::Network(e.to_string())
                }
            })?;

        let expires_at_ms = response.expires_at_ms(now_millis());
        let scopes = response.scopes();
        let update = TokenUpdate {
            access: Secret::new(response.access_token),
            refresh: response.refresh_token.map(Secret::new),
            expires_at_ms,
            scopes,
        };
        let updated = lock.replace_oauth_tokens(update).await.map_err(store_error)?;
        info!(credential = %name, expires_at_ms, "token refreshed");
        Ok(updated.secret)
    }

    fn sweep(&self) -> SweepOutcome {
        let stale_flights = self.flights.sweep(self.settings.in_flight_timeout);
        let expired_cooldowns = {
            let mut negative = self.negative.lock().unwrap_or_else(PoisonError::into_inner);
            let before = negative.len();
            negative.retain(|_, entry| entry.recorded_at.elapsed() < self.settings.cooldown);
            before - negative.len()
        };
        if stale_flights > 0 || expired_cooldowns > 0 {
            debug!(stale_flights, expired_cooldowns, "refresh sweep");
        }
        SweepOutcome {
            stale_flights,
            expired_cooldowns,
        }
    }
}

fn store_error(e: credential_store::Error) -> RefreshError {
    RefreshError::Store(e.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use credential_store::{NewCredential, SecretCipher};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Outcome {
        Succeed,
        Reject,
        Unreachable,
    }

    /// Token endpoint stand-in: counts calls, sleeps, then answers.
    pub(crate) struct FakeExchanger {
        pub calls: AtomicUsize,
        pub delay: Duration,
        pub outcome: Mutex<Outcome>,
    }

    impl FakeExchanger {
        pub fn new(outcome: Outcome, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                outcome: Mutex::new(outcome),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn set(&self, outcome: Outcome) {
            *self.outcome.lock().unwrap() = outcome;
        }
    }

    impl TokenExchanger for FakeExchanger {
        fn exchange_refresh_token<'a>(&'a self, _refresh_token: &'a str) -> ExchangeFuture<'a> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.delay).await;
                let outcome = *self.outcome.lock().unwrap();
                match outcome {
                    Outcome::Succeed => Ok(TokenResponse {
                        access_token: format!("at_refreshed_{n}"),
                        refresh_token: Some(format!("rt_refreshed_{n}")),
                        expires_in: 3600,
                        scope: None,
                    }),
                    Outcome::Reject => Err(oauth::Error::InvalidCredentials("invalid_grant".into())),
                    Outcome::Unreachable => Err(oauth::Error::Http("connection refused".into())),
                }
            })
        }
    }

    pub(crate) async fn store(dir: &tempfile::TempDir) -> Arc<CredentialStore> {
        let cipher = SecretCipher::new(Secret::from("test-master-key-0123456789abcdef")).unwrap();
        Arc::new(
            CredentialStore::load(dir.path().join("credentials.json"), cipher)
                .await
                .unwrap(),
        )
    }

    pub(crate) async fn add_oauth(store: &CredentialStore, name: &str, expires_at_ms: u64) -> Credential {
        let summary = store
            .create_credential(NewCredential::oauth(
                name,
                Secret::from(format!("at_{name}")),
                Some(Secret::from(format!("rt_{name}"))),
                expires_at_ms,
                vec![],
            ))
            .await
            .unwrap();
        store.credential(&summary.id).await.unwrap()
    }

    fn settings() -> RefreshSettings {
        RefreshSettings {
            buffer: Duration::from_secs(60),
            cooldown: Duration::from_millis(200),
            in_flight_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
        }
    }

    fn expired() -> u64 {
        now_millis() - 1_000
    }

    fn valid() -> u64 {
        now_millis() + 3_600_000
    }

    #[tokio::test]
    async fn api_keys_and_fresh_tokens_skip_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let exchanger = FakeExchanger::new(Outcome::Succeed, Duration::ZERO);
        let coordinator = RefreshCoordinator::new(store.clone(), exchanger.clone(), settings());

        let fresh = add_oauth(&store, "fresh", valid()).await;
        assert_eq!(coordinator.current_token(&fresh).await.unwrap().expose(), "at_fresh");

        let summary = store
            .create_credential(NewCredential::api_key(
                "key",
                common::ProviderKind::Native,
                Secret::from("sk-key"),
            ))
            .await
            .unwrap();
        let key = store.credential(&summary.id).await.unwrap();
        assert_eq!(coordinator.current_token(&key).await.unwrap().expose(), "sk-key");

        assert_eq!(exchanger.calls(), 0);
        assert_eq!(coordinator.stats().attempts, 0);
    }

    #[test]
    fn due_inside_buffer() {
        let s = RefreshSettings::default();
        let mut cred = Credential {
            id: "id".into(),
            name: "n".into(),
            kind: common::CredentialKind::OAuth,
            provider_kind: common::ProviderKind::Native,
            secret: Secret::from("at"),
            refresh_secret: None,
            expires_at_ms: Some(100_000),
            scopes: vec![],
            region: None,
            active: true,
            created_at_ms: 0,
            last_used_at_ms: None,
        };
        assert!(!s.is_due(&cred, 39_999));
        assert!(s.is_due(&cred, 40_000));
        cred.expires_at_ms = None;
        assert!(!s.is_due(&cred, u64::MAX));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let exchanger = FakeExchanger::new(Outcome::Succeed, Duration::from_millis(100));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchanger.clone(), settings()));
        let cred = add_oauth(&store, "a", expired()).await;

        let mut handles = vec![];
        for _ in 0..16 {
            let coordinator = coordinator.clone();
            let cred = cred.clone();
            handles.push(tokio::spawn(async move {
                coordinator.current_token(&cred).await.map(|s| s.expose().clone())
            }));
        }
        let mut tokens = vec![];
        for h in handles {
            tokens.push(h.await.unwrap().unwrap());
        }

        assert_eq!(exchanger.calls(), 1, "exactly one token-endpoint call");
        assert!(tokens.iter().all(|t| t == "at_refreshed_1"));

        let stats = coordinator.stats();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.concurrent_attaches, 15);
        assert_eq!(stats.in_flight, 0);

        let stored = store.credential(&cred.id).await.unwrap();
        assert_eq!(stored.secret.expose(), "at_refreshed_1");
        assert_eq!(stored.refresh_secret.unwrap().expose(), "rt_refreshed_1");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let exchanger = FakeExchanger::new(Outcome::Reject, Duration::from_millis(100));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchanger.clone(), settings()));
        let cred = add_oauth(&store, "a", expired()).await;

        let mut handles = vec![];
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let cred = cred.clone();
            handles.push(tokio::spawn(async move { coordinator.current_token(&cred).await }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, RefreshError::Rejected(_)), "got {err:?}");
        }
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test]
    async fn failure_cools_down_then_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let exchanger = FakeExchanger::new(Outcome::Unreachable, Duration::ZERO);
        let coordinator = RefreshCoordinator::new(store.clone(), exchanger.clone(), settings());
        let cred = add_oauth(&store, "a", expired()).await;

        let err = coordinator.current_token(&cred).await.unwrap_err();
        assert!(matches!(err, RefreshError::Network(_)));
        assert_eq!(exchanger.calls(), 1);

        for _ in 0..5 {
            let err = coordinator.current_token(&cred).await.unwrap_err();
            match err {
                RefreshError::CoolingDown { reason } => assert!(reason.contains("connection refused")),
                other => panic!("expected cooldown, got {other:?}"),
            }
        }
        assert_eq!(exchanger.calls(), 1, "no upstream call during cooldown");
        assert_eq!(coordinator.stats().cooldown_rejections, 5);

        tokio::time::sleep(Duration::from_millis(250)).await;
        exchanger.set(Outcome::Succeed);
        let token = coordinator.current_token(&cred).await.unwrap();
        assert_eq!(token.expose(), "at_refreshed_2");
        assert_eq!(exchanger.calls(), 2);
        assert_eq!(coordinator.stats().cooling_down, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn one_upstream_call_per_credential_within_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let exchanger = FakeExchanger::new(Outcome::Unreachable, Duration::ZERO);
        let coordinator = Arc::new(RefreshCoordinator::new(
            store.clone(),
            exchanger.clone(),
            RefreshSettings {
                cooldown: Duration::from_secs(60),
                ..settings()
            },
        ));

        let mut creds = vec![];
        for i in 0..48 {
            creds.push(add_oauth(&store, &format!("c{i}"), expired()).await);
        }
        let creds = Arc::new(creds);

        let mut handles = vec![];
        for _ in 0..16 {
            let coordinator = coordinator.clone();
            let creds = creds.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    for cred in creds.iter() {
                        assert!(coordinator.current_token(cred).await.is_err());
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(exchanger.calls(), creds.len());
        let stats = coordinator.stats();
        assert_eq!(stats.attempts, creds.len() as u64);
        assert_eq!(stats.failures, creds.len() as u64);
    }

    #[tokio::test]
    async fn refresh_by_another_process_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let exchanger = FakeExchanger::new(Outcome::Succeed, Duration::ZERO);
        let first_store = store(&dir).await;
        let stale = add_oauth(&first_store, "a", expired()).await;
        // Loaded before the refresh: its mirror still holds the expired token.
        let second_store = store(&dir).await;

        let first = RefreshCoordinator::new(first_store, exchanger.clone(), settings());
        assert_eq!(first.current_token(&stale).await.unwrap().expose(), "at_refreshed_1");

        let second = RefreshCoordinator::new(second_store.clone(), exchanger.clone(), settings());
        assert_eq!(second.current_token(&stale).await.unwrap().expose(), "at_refreshed_1");
        assert_eq!(exchanger.calls(), 1);
        assert_eq!(
            second_store.credential(&stale.id).await.unwrap().refresh_secret.unwrap().expose(),
            "rt_refreshed_1"
        );
    }

    #[tokio::test]
    async fn stale_snapshot_rereads_instead_of_refreshing_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let exchanger = FakeExchanger::new(Outcome::Succeed, Duration::ZERO);
        let stale = add_oauth(&store, "a", expired()).await;

        let first = RefreshCoordinator::new(store.clone(), exchanger.clone(), settings());
        assert_eq!(first.current_token(&stale).await.unwrap().expose(), "at_refreshed_1");

        // A second coordinator (another worker) still holds the expired snapshot.
        let second = RefreshCoordinator::new(store.clone(), exchanger.clone(), settings());
        assert_eq!(second.current_token(&stale).await.unwrap().expose(), "at_refreshed_1");
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let exchanger = FakeExchanger::new(Outcome::Succeed, Duration::ZERO);
        let coordinator = RefreshCoordinator::new(store.clone(), exchanger.clone(), settings());
        let summary = store
            .create_credential(NewCredential::oauth("bare", Secret::from("at"), None, expired(), vec![]))
            .await
            .unwrap();
        let cred = store.credential(&summary.id).await.unwrap();

        assert_eq!(
            coordinator.current_token(&cred).await.unwrap_err(),
            RefreshError::MissingRefreshToken
        );
        assert_eq!(exchanger.calls(), 0);
    }

    #[tokio::test]
    async fn sweep_drops_stale_flights_and_expired_cooldowns() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let exchanger = FakeExchanger::new(Outcome::Reject, Duration::from_millis(300));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchanger.clone(), settings()));
        let cred = add_oauth(&store, "a", expired()).await;

        let caller = {
            let coordinator = coordinator.clone();
            let cred = cred.clone();
            tokio::spawn(async move { coordinator.current_token(&cred).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coordinator.stats().in_flight, 1);
        assert_eq!(coordinator.sweep().stale_flights, 1);
        assert_eq!(coordinator.stats().in_flight, 0);

        // The attached caller still receives the outcome.
        assert!(caller.await.unwrap().is_err());
        assert_eq!(coordinator.stats().cooling_down, 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(coordinator.sweep().expired_cooldowns, 1);
        assert_eq!(coordinator.stats().cooling_down, 0);
    }

    #[tokio::test]
    async fn start_and_stop_sweep_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let coordinator = RefreshCoordinator::new(
            store,
            FakeExchanger::new(Outcome::Succeed, Duration::ZERO),
            settings(),
        );
        assert!(!coordinator.is_running());
        coordinator.start();
        assert!(coordinator.is_running());
        coordinator.stop();
        assert!(!coordinator.is_running());
    }
}
