//! OAuth state management for CSRF protection.
//!
//! Issues temporary, single-use state tokens that bind an authorization start
//! to its callback.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::ConnectorError;

/// What a state token was issued for
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub platform: String,
    pub user_id: String,
    pub redirect_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// State token store with expiry, shared by every provider in a registry
#[derive(Clone)]
pub struct StateManager {
    states: Arc<DashMap<String, StateEntry>>,
    ttl: Duration,
}

impl StateManager {
    /// Create a state manager whose tokens live `ttl_seconds` (default config: 600)
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Generate a new state token and remember who it belongs to
    ///
    /// Returns the token (UUID v4, 122 random bits).
    pub fn issue(&self, platform: &str, user_id: &str, redirect_uri: Option<String>) -> String {
        self.cleanup_expired();

        let state = Uuid::new_v4().to_string();
        let entry = StateEntry {
            platform: platform.to_string(),
            user_id: user_id.to_string(),
            redirect_uri,
            created_at: Utc::now(),
        };
        self.states.insert(state.clone(), entry);

        state
    }

    /// Validate and consume a state token
    ///
    /// The token is removed whatever the outcome, so a second call with the
    /// same value always fails.
    pub fn consume(&self, state: &str, platform: &str) -> Result<StateEntry, ConnectorError> {
        if state.is_empty() {
            return Err(ConnectorError::InvalidState);
        }

        let (_, entry) = self
            .states
            .remove(state)
            .ok_or(ConnectorError::InvalidState)?;

        if Utc::now() - entry.created_at > self.ttl {
            return Err(ConnectorError::InvalidState);
        }
        if entry.platform != platform {
            return Err(ConnectorError::InvalidState);
        }

        Ok(entry)
    }

    /// Drop expired entries
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        self.states
            .retain(|_, entry| now - entry.created_at <= self.ttl);
    }

    /// Number of outstanding tokens
    pub fn count(&self) -> usize {
        self.states.len()
    }
}

/// Periodically drop expired state tokens until the task is aborted
pub async fn run_state_cleanup(manager: StateManager, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!(remaining = manager.count(), "OAuth state cleanup complete");
    }
}
