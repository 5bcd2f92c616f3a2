//! Cached, coalesced token counting

use std::sync::Arc;
use std::time::Duration;

use common::{Role, SingleFlight};
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::request::{CountTokensRequest, serialize_request};
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone, Copy)]
pub struct TokenCountSettings {
    pub cache_capacity: u64,
    /// Entries expire after this long regardless of eviction pressure.
    pub ttl: Duration,
    /// In-flight computations older than this are swept.
    pub in_flight_timeout: Duration,
}

impl Default for TokenCountSettings {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            ttl: Duration::from_secs(3600),
            in_flight_timeout: Duration::from_secs(30),
        }
    }
}

/// Token counts keyed by the SHA-256 of the flattened request text.
pub struct TokenCountApproximator {
    tokenizer: Arc<dyn Tokenizer>,
    cache: Cache<String, usize>,
    flights: SingleFlight<String, std::result::Result<usize, String>>,
    settings: TokenCountSettings,
}

impl TokenCountApproximator {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, settings: TokenCountSettings) -> Self {
        let cache = Cache::builder()
            .max_capacity(settings.cache_capacity)
            .time_to_live(settings.ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            tokenizer,
            cache,
            flights: SingleFlight::new(),
            settings,
        }
    }

    pub async fn count(&self, request: &CountTokensRequest) -> Result<usize> {
        self.count_text(serialize_request(request)).await
    }

    /// Count tokens in already-flattened text.
    pub async fn count_text(&self, text: String) -> Result<usize> {
        let key = content_key(&text);
        if let Some(count) = self.cache.get(&key).await {
            metrics::counter!("gateway_token_count_cache_total", "result" => "hit").increment(1);
            return Ok(count);
        }
        metrics::counter!("gateway_token_count_cache_total", "result" => "miss").increment(1);

        let tokenizer = Arc::clone(&self.tokenizer);
        let cache = self.cache.clone();
        let cache_key = key.clone();
        let (result, role) = self
            .flights
            .run(key, async move {
                let counted = tokio::task::spawn_blocking(move || tokenizer.count(&text)).await;
                match counted {
                    Ok(count) => {
                        cache.insert(cache_key, count).await;
                        Ok(count)
                    }
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;

        if role == Role::Follower {
            debug!("attached to in-flight token count");
        }
        match result {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(message)) => Err(Error::Tokenizer(message)),
            Err(aborted) => Err(Error::Tokenizer(aborted.to_string())),
        }
    }

    /// Drop in-flight computations older than the hard timeout.
    pub fn sweep(&self) -> usize {
        self.flights.sweep(self.settings.in_flight_timeout)
    }

    pub fn settings(&self) -> &TokenCountSettings {
        &self.settings
    }
}

fn content_key(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
