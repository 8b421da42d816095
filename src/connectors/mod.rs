//! OAuth connectors for external creator platforms.
//!
//! Implements the authorization code flow behind one object-safe trait:
//! 1. Caller asks the registry for a platform's provider
//! 2. `start` issues a single-use state token and returns the connect URL
//! 3. User authorizes on the platform's site
//! 4. The callback endpoint assembles a [`ConnectorCallbackPayload`]
//! 5. `complete` validates the state, exchanges the code and fetches the profile
//! 6. `refresh` renews the access token when it nears expiry
//!
//! Callers never see platform endpoints, scopes or profile formats; they only
//! get [`ConnectorProfile`] values and [`ConnectorError`]s.

mod exchange;
mod oauth;
mod platform;
pub mod registry;
mod state;

pub use oauth::OAuthConnector;
pub use platform::{Endpoints, Platform};
pub use registry::ConnectorRegistry;
pub use state::{run_state_cleanup, StateEntry, StateManager};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// External identity fetched after a successful authorization.
///
/// Immutable once built: a refresh or re-auth produces a new value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectorProfile {
    pub platform: String,
    pub platform_user_id: String,
    /// Normalized handle with a leading `@` (see [`crate::identity::to_handle`])
    pub handle: String,
    pub display_name: String,
    pub follower_count: u64,
    pub profile_picture_url: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub provider: String,
    pub metadata: BTreeMap<String, String>,
}

impl ConnectorProfile {
    /// True when the access token is expired or expires within `skew`.
    ///
    /// Tokens without an expiry never need a refresh.
    pub fn expires_within(&self, skew: Duration, now: DateTime<Utc>) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at <= now + skew,
            None => false,
        }
    }
}

/// Result of `start`: where to send the user, and the state that must come back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectorStartResult {
    pub platform: String,
    pub connect_url: String,
    pub state: String,
    pub provider: String,
}

/// Everything the callback endpoint must collect before calling `complete`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorCallbackPayload {
    pub platform: String,
    pub code: String,
    pub state: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// The user an authorization attempt is issued for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    /// Overrides the platform's configured callback URL
    pub redirect_uri: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            redirect_uri: None,
        }
    }
}

/// Connector failures callers can branch on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// Platform unknown, disabled or missing credentials. Never retried.
    #[error("connector '{platform}' is not configured or not enabled")]
    Unavailable { platform: String },

    /// Anti-forgery check failed: unknown, expired, replayed or mismatched state.
    #[error("invalid or expired OAuth state")]
    InvalidState,

    /// Refresh token missing or rejected; the user has to reconnect.
    #[error("token refresh failed for '{platform}': {reason}")]
    TokenRefreshFailed { platform: String, reason: String },

    /// Platform rejected the authorization code.
    #[error("authorization code exchange failed for '{platform}': {reason}")]
    Exchange { platform: String, reason: String },

    /// Timeout, connection failure, rate limit or 5xx from the platform.
    #[error("request to '{platform}' failed: {reason}")]
    Transport { platform: String, reason: String },

    /// Profile endpoint answered with something we cannot read.
    #[error("unexpected profile response from '{platform}': {reason}")]
    Profile { platform: String, reason: String },
}

impl ConnectorError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transport { .. })
    }
}

/// One external platform's OAuth integration.
///
/// Providers are stateless apart from the shared [`StateManager`]; credentials
/// and endpoints are fixed when the registry builds them.
#[async_trait]
pub trait ConnectorProvider: Send + Sync {
    /// Platform key (e.g. "instagram")
    fn platform(&self) -> &str;

    /// Human-readable provider identifier stored on profiles
    fn provider_name(&self) -> &str;

    /// Issue a state token for `user` and build the authorization URL.
    fn start(&self, user: &UserContext) -> Result<ConnectorStartResult, ConnectorError>;

    /// Validate and consume the state, exchange the code, fetch the profile.
    ///
    /// A state token works at most once; replays fail with `InvalidState`.
    async fn complete(
        &self,
        payload: &ConnectorCallbackPayload,
    ) -> Result<ConnectorProfile, ConnectorError>;

    /// Return a profile with a usable access token, refreshing if near expiry.
    async fn refresh(&self, profile: &ConnectorProfile) -> Result<ConnectorProfile, ConnectorError>;
}
