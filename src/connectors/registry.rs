//! Connector registry - maps platform keys to providers.
//!
//! Providers are built once from configuration; callers only see the
//! capability map and `Arc<dyn ConnectorProvider>` handles.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{ConnectorError, ConnectorProvider, OAuthConnector, Platform, StateManager};
use crate::config::ConnectorsConfig;

pub struct ConnectorRegistry {
    providers: BTreeMap<String, Arc<dyn ConnectorProvider>>,
    /// Every platform key the registry knows about, configured or not
    known: Vec<String>,
    states: StateManager,
}

impl ConnectorRegistry {
    /// Build providers for every configured and enabled platform.
    ///
    /// Unknown platform keys in the configuration are logged and ignored.
    pub fn from_config(config: &ConnectorsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .user_agent("creatorlink-connector/1.0")
            .build()
            .context("Failed to build HTTP client")?;

        let states = StateManager::new(config.state_ttl_seconds);
        let mut registry = Self::empty(states.clone());

        for (key, platform_config) in &config.platforms {
            let Some(platform) = Platform::parse(key) else {
                warn!(platform = %key, "Ignoring configuration for unknown platform");
                continue;
            };
            if !platform_config.is_configured() {
                info!(platform = %platform, "Platform disabled or missing credentials");
                continue;
            }

            registry = registry.with_provider(Arc::new(OAuthConnector::new(
                platform,
                platform_config.clone(),
                states.clone(),
                http.clone(),
                config.refresh_skew_seconds,
            )));
        }

        info!(
            enabled = registry.providers.len(),
            "Connector registry initialized"
        );

        Ok(registry)
    }

    /// Registry with no providers; every built-in platform reports `false`.
    pub fn empty(states: StateManager) -> Self {
        Self {
            providers: BTreeMap::new(),
            known: Platform::ALL.iter().map(|p| p.as_str().to_string()).collect(),
            states,
        }
    }

    /// Register (or replace) a provider under its own platform key.
    pub fn with_provider(mut self, provider: Arc<dyn ConnectorProvider>) -> Self {
        let key = normalize_key(provider.platform());
        if !self.known.contains(&key) {
            self.known.push(key.clone());
        }
        self.providers.insert(key, provider);
        self
    }

    /// Which platforms can currently be connected. Never fails.
    pub fn capabilities(&self) -> BTreeMap<String, bool> {
        self.known
            .iter()
            .map(|key| (key.clone(), self.providers.contains_key(key)))
            .collect()
    }

    /// Resolve the provider for a platform.
    pub fn get(&self, platform: &str) -> Result<Arc<dyn ConnectorProvider>, ConnectorError> {
        let key = normalize_key(platform);
        self.providers
            .get(&key)
            .cloned()
            .ok_or(ConnectorError::Unavailable { platform: key })
    }

    /// State manager shared by the registry's providers
    pub fn states(&self) -> &StateManager {
        &self.states
    }
}

fn normalize_key(platform: &str) -> String {
    platform.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;

    fn platform(enabled: bool) -> PlatformConfig {
        PlatformConfig {
            enabled,
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "https://app.example.com/callback".to_string(),
            ..Default::default()
        }
    }

    fn config() -> ConnectorsConfig {
        let mut config = ConnectorsConfig::default();
        config.platforms.insert("instagram".to_string(), platform(true));
        config.platforms.insert("tiktok".to_string(), platform(false));
        config.platforms.insert("friendster".to_string(), platform(true));
        config
    }

    #[test]
    fn test_capabilities_report_every_known_platform() {
        let registry = ConnectorRegistry::from_config(&config()).unwrap();
        let caps = registry.capabilities();

        assert_eq!(caps.get("instagram"), Some(&true));
        assert_eq!(caps.get("tiktok"), Some(&false));
        assert_eq!(caps.get("youtube"), Some(&false));
        assert!(!caps.contains_key("friendster"));
    }

    #[test]
    fn test_disabled_platform_is_unavailable() {
        let registry = ConnectorRegistry::from_config(&config()).unwrap();

        let err = registry.get("tiktok").err().unwrap();
        assert_eq!(
            err,
            ConnectorError::Unavailable {
                platform: "tiktok".to_string()
            }
        );
        assert!(registry.get("myspace").is_err());
    }

    #[test]
    fn test_get_is_case_insensitive() {
        let registry = ConnectorRegistry::from_config(&config()).unwrap();

        let provider = registry.get(" Instagram ").unwrap();
        assert_eq!(provider.platform(), "instagram");
        assert_eq!(provider.provider_name(), "instagram-graph");
    }

    #[test]
    fn test_providers_issue_into_the_shared_state_manager() {
        let registry = ConnectorRegistry::from_config(&config()).unwrap();
        let provider = registry.get("instagram").unwrap();

        let start = provider
            .start(&crate::connectors::UserContext::new("user-1"))
            .unwrap();
        assert_eq!(registry.states().count(), 1);

        registry.states().cleanup_expired();
        assert_eq!(registry.states().count(), 1);
        assert!(registry.states().consume(&start.state, "instagram").is_ok());
        assert_eq!(registry.states().count(), 0);
    }

    #[test]
    fn test_empty_registry() {
        let registry = ConnectorRegistry::empty(StateManager::new(600));
        assert!(registry.capabilities().values().all(|enabled| !enabled));
        assert_eq!(registry.capabilities().len(), Platform::ALL.len());
    }
}
