use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::connectors::Platform;
use crate::jobs::RetryPolicy;

// Re-export queue config alongside the rest
pub use crate::queue::NatsQueueConfig;

/// Complete configuration, injected into the registry, dispatcher and worker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub connectors: ConnectorsConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub queue: NatsQueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
}

/// Connector configuration: OAuth state, HTTP limits and per-platform credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorsConfig {
    /// How long an issued state token stays valid (seconds)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    /// Timeout applied to every platform HTTP call (seconds)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    /// Refresh tokens that expire within this window (seconds)
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_seconds: i64,
    /// How often abandoned state tokens are swept (seconds)
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
    /// Keyed by platform name ("instagram", "tiktok", "youtube")
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_http_timeout() -> u64 {
    10
}

fn default_refresh_skew() -> i64 {
    90
}

fn default_state_cleanup_interval() -> u64 {
    60
}

impl ConnectorsConfig {
    pub fn state_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.state_cleanup_interval_seconds.max(1))
    }
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            http_timeout_seconds: default_http_timeout(),
            refresh_skew_seconds: default_refresh_skew(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
            platforms: BTreeMap::new(),
        }
    }
}

/// OAuth client settings for one platform.
///
/// Endpoint overrides exist for staging environments and mock servers; when
/// unset the platform's public endpoints are used.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Callback URL registered with the platform
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub profile_url: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl PlatformConfig {
    /// Enabled and carrying a client id and secret.
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

/// Job defaults: attempt budget, backoff and handler time limit.
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_seconds: u64,
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_seconds: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_max() -> u64 {
    900
}

fn default_handler_timeout() -> u64 {
    300
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base(),
            backoff_max_seconds: default_backoff_max(),
            handler_timeout_seconds: default_handler_timeout(),
        }
    }
}

impl JobsConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.backoff_base_seconds),
            Duration::from_secs(self.backoff_max_seconds),
        )
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_seconds)
    }
}

/// Job repository location.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_jobs_db")]
    pub database_path: String,
}

fn default_jobs_db() -> String {
    "jobs.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_jobs_db(),
        }
    }
}

/// Connected-account storage. The key is base64 for 32 raw bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsConfig {
    #[serde(default = "default_accounts_db")]
    pub database_path: String,
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_accounts_db() -> String {
    "accounts.db".to_string()
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            database_path: default_accounts_db(),
            encryption_key: None,
        }
    }
}

/// External processing service that executes transcript, ingest and repost work.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_processor_url")]
    pub base_url: String,
    #[serde(default = "default_processor_timeout")]
    pub timeout_seconds: u64,
}

fn default_processor_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_processor_timeout() -> u64 {
    120
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            base_url: default_processor_url(),
            timeout_seconds: default_processor_timeout(),
        }
    }
}

impl AppConfig {
    /// Overlay `CREATORLINK_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay variables from an arbitrary lookup (the process env in production).
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CREATORLINK_NATS_URL") {
            self.queue.url = v;
        }
        if let Some(v) = lookup("CREATORLINK_JOBS_DB") {
            self.store.database_path = v;
        }
        if let Some(v) = lookup("CREATORLINK_ACCOUNTS_DB") {
            self.accounts.database_path = v;
        }
        if let Some(v) = lookup("CREATORLINK_ENCRYPTION_KEY") {
            self.accounts.encryption_key = Some(v);
        }
        if let Some(v) = lookup("CREATORLINK_PROCESSOR_URL") {
            self.processor.base_url = v;
        }
        if let Some(v) = lookup("CREATORLINK_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.jobs.default_max_attempts = n;
            }
        }

        for platform in Platform::ALL {
            let prefix = format!("CREATORLINK_OAUTH_{}", platform.as_str().to_uppercase());
            let client_id = lookup(&format!("{}_CLIENT_ID", prefix));
            let client_secret = lookup(&format!("{}_CLIENT_SECRET", prefix));
            let redirect_uri = lookup(&format!("{}_REDIRECT_URI", prefix));
            if client_id.is_none() && client_secret.is_none() && redirect_uri.is_none() {
                continue;
            }

            let entry = self
                .connectors
                .platforms
                .entry(platform.as_str().to_string())
                .or_insert_with(|| PlatformConfig {
                    enabled: true,
                    ..Default::default()
                });
            if let Some(v) = client_id {
                entry.client_id = v;
            }
            if let Some(v) = client_secret {
                entry.client_secret = v;
            }
            if let Some(v) = redirect_uri {
                entry.redirect_uri = v;
            }
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
