//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The master key is loaded from GATEWAY_MASTER_KEY or master_key_file,
//! never stored in the TOML directly to avoid leaking secrets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use credential_pool::RefreshSettings;
use credential_store::MIN_MASTER_KEY_LEN;
use oauth::OAuthConfig;
use provider::{CloudRuntimeSettings, NativeSettings, RetryPolicy};
use serde::Deserialize;
use token_count::TokenCountSettings;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub native: NativeConfig,
    #[serde(default)]
    pub cloud_runtime: CloudRuntimeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub token_count: TokenCountConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener; the admin API is disabled when unset.
    #[serde(default)]
    pub admin_addr: Option<SocketAddr>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(skip)]
    pub master_key: Option<Secret<String>>,
    /// Path to a file containing the master key (alternative to GATEWAY_MASTER_KEY)
    #[serde(default)]
    pub master_key_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub buffer_secs: u64,
    pub cooldown_secs: u64,
    pub in_flight_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            buffer_secs: 60,
            cooldown_secs: 5,
            in_flight_timeout_secs: 30,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CloudRuntimeConfig {
    /// Endpoint override; `{region}` is substituted.
    pub base_url: Option<String>,
    pub default_region: String,
    pub timeout_secs: u64,
    /// Extra canonical-name to runtime-id mappings.
    pub models: HashMap<String, String>,
}

impl Default for CloudRuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_region: provider::cloud_runtime::DEFAULT_REGION.to_string(),
            timeout_secs: 600,
            models: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TokenCountConfig {
    pub cache_capacity: u64,
    pub ttl_secs: u64,
    pub in_flight_timeout_secs: u64,
}

impl Default for TokenCountConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            ttl_secs: 3600,
            in_flight_timeout_secs: 30,
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Master key resolution order:
    /// 1. GATEWAY_MASTER_KEY env var
    /// 2. master_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.validate()?;

        if let Ok(key) = std::env::var("GATEWAY_MASTER_KEY") {
            config.security.master_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.security.master_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read master_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.security.master_key = Some(Secret::new(key));
            }
        }

        if let Some(key) = &config.security.master_key
            && key.expose().chars().count() < MIN_MASTER_KEY_LEN
        {
            return Err(common::Error::Config(format!(
                "master key must be at least {MIN_MASTER_KEY_LEN} characters"
            )));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("native.base_url", &self.native.base_url)?;
        if let Some(url) = &self.cloud_runtime.base_url {
            require_http_url("cloud_runtime.base_url", url)?;
        }
        require_http_url("oauth.token_endpoint", &self.oauth.token_endpoint)?;
        require_http_url("oauth.authorize_endpoint", &self.oauth.authorize_endpoint)?;

        let nonzero = [
            ("server.max_connections", self.server.max_connections as u64),
            ("server.max_body_bytes", self.server.max_body_bytes as u64),
            ("native.timeout_secs", self.native.timeout_secs),
            ("cloud_runtime.timeout_secs", self.cloud_runtime.timeout_secs),
            ("refresh.in_flight_timeout_secs", self.refresh.in_flight_timeout_secs),
            ("refresh.sweep_interval_secs", self.refresh.sweep_interval_secs),
            ("retry.max_attempts", self.retry.max_attempts as u64),
            ("token_count.cache_capacity", self.token_count.cache_capacity),
            ("token_count.ttl_secs", self.token_count.ttl_secs),
            ("token_count.in_flight_timeout_secs", self.token_count.in_flight_timeout_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(common::Error::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.cloud_runtime.default_region.trim().is_empty() {
            return Err(common::Error::Config(
                "cloud_runtime.default_region must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// The resolved master key, required to open the credential store.
    pub fn master_key(&self) -> common::Result<&Secret<String>> {
        self.security.master_key.as_ref().ok_or_else(|| {
            common::Error::Config(
                "no master key: set GATEWAY_MASTER_KEY or security.master_key_file".into(),
            )
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
        }
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            buffer: Duration::from_secs(self.refresh.buffer_secs),
            cooldown: Duration::from_secs(self.refresh.cooldown_secs),
            in_flight_timeout: Duration::from_secs(self.refresh.in_flight_timeout_secs),
            sweep_interval: Duration::from_secs(self.refresh.sweep_interval_secs),
        }
    }

    pub fn native_settings(&self) -> NativeSettings {
        NativeSettings {
            base_url: self.native.base_url.clone(),
            timeout: Duration::from_secs(self.native.timeout_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn cloud_runtime_settings(&self) -> CloudRuntimeSettings {
        CloudRuntimeSettings {
            base_url: self.cloud_runtime.base_url.clone(),
            default_region: self.cloud_runtime.default_region.clone(),
            models: self.cloud_runtime.models.clone(),
            timeout: Duration::from_secs(self.cloud_runtime.timeout_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn token_count_settings(&self) -> TokenCountSettings {
        TokenCountSettings {
            cache_capacity: self.token_count.cache_capacity,
            ttl: Duration::from_secs(self.token_count.ttl_secs),
            in_flight_timeout: Duration::from_secs(self.token_count.in_flight_timeout_secs),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("llm-gateway.toml")
    }
}

fn require_http_url(name: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {url}"
        )))
    }
}
