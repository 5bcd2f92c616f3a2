//! LLM credential gateway
//!
//! Single-binary service that:
//! 1. Loads encrypted credentials and routing entities from disk
//! 2. Authenticates clients by gateway token and picks a credential per request
//! 3. Keeps OAuth credentials fresh with at most one refresh in flight each
//! 4. Forwards to the native API or the cloud runtime, streaming faithfully
//! 5. Serves an optional admin API on a separate listener

mod admin;
mod config;
mod error;
mod ledger;
mod metrics;
mod proxy;
mod service;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use credential_pool::{AccountSelector, RefreshCoordinator};
use credential_store::{CredentialStore, SecretCipher};
use oauth::OAuthClient;
use provider::{CloudRuntimeGateway, NativeGateway, Upstreams};
use token_count::{TiktokenTokenizer, TokenCountApproximator};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::ledger::TracingLedger;
use crate::proxy::{AppState, build_router};
use crate::service::GatewayCore;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting llm-gateway");

    // Before anything emits metrics
    let prometheus = metrics::install_recorder()?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = ?config.server.admin_addr,
        credentials_path = %config.storage.credentials_path.display(),
        native_base_url = %config.native.base_url,
        default_region = %config.cloud_runtime.default_region,
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let cipher = SecretCipher::new(config.master_key()?.clone())
        .context("failed to initialize secret cipher")?;
    let store = Arc::new(
        CredentialStore::load(config.storage.credentials_path.clone(), cipher)
            .await
            .context("failed to load credential store")?,
    );

    let oauth = Arc::new(OAuthClient::new(http.clone(), config.oauth.clone()));
    let refresh = Arc::new(RefreshCoordinator::new(
        store.clone(),
        oauth.clone(),
        config.refresh_settings(),
    ));
    refresh.start();

    let upstreams = Upstreams::new(
        NativeGateway::new(http.clone(), config.native_settings()),
        CloudRuntimeGateway::new(http, config.cloud_runtime_settings()),
    );

    // Loading the BPE tables takes a moment; keep it off the first request.
    tokio::task::spawn_blocking(TiktokenTokenizer::preload)
        .await
        .context("tokenizer preload panicked")?;
    let approximator =
        TokenCountApproximator::new(Arc::new(TiktokenTokenizer), config.token_count_settings());

    let core = Arc::new(GatewayCore::new(
        store.clone(),
        AccountSelector::new(store.clone(), refresh.clone()),
        upstreams,
        approximator,
        Arc::new(TracingLedger),
    ));
    let sweeper = spawn_token_count_sweep(
        core.clone(),
        Duration::from_secs(config.token_count.in_flight_timeout_secs),
    );

    let app = build_router(
        AppState {
            core,
            prometheus,
            started_at: Instant::now(),
            max_body_bytes: config.server.max_body_bytes,
        },
        config.server.max_connections,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = vec![serve(app, config.server.listen_addr, "public", shutdown_rx.clone()).await?];
    if let Some(admin_addr) = config.server.admin_addr {
        let admin = build_admin_router(AdminState::new(store, refresh.clone(), oauth));
        servers.push(serve(admin, admin_addr, "admin", shutdown_rx).await?);
    }

    shutdown_signal().await;
    // Receivers only disappear once their server has stopped.
    let _ = shutdown_tx.send(true);

    // The drain timer starts at signal receipt, not at startup.
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        for server in servers {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "server error during shutdown"),
                Err(e) => error!(error = %e, "server task panicked"),
            }
        }
    })
    .await;
    match drained {
        Ok(()) => info!("all in-flight requests drained"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    sweeper.abort();
    refresh.stop();
    info!("shutdown complete");
    Ok(())
}

/// Bind `addr` and serve `app` until the shutdown flag flips.
async fn serve(
    app: Router,
    addr: SocketAddr,
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<std::io::Result<()>>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {name} listener to {addr}"))?;
    info!(addr = %addr, listener = name, "accepting requests");

    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
    }))
}

/// Periodically drop token-count computations stuck past their timeout.
fn spawn_token_count_sweep(core: Arc<GatewayCore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let swept = core.sweep_token_counts();
            if swept > 0 {
                warn!(swept, "dropped stuck token-count computations");
            }
        }
    })
}

/// Wait for SIGTERM or SIGINT.
///
/// A handler that cannot be installed is logged and never fires; the other
/// one still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
