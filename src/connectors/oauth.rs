//! Authorization code flow shared by every platform.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::exchange::{self, CallError};
use super::platform::{Endpoints, Platform};
use super::{
    ConnectorCallbackPayload, ConnectorError, ConnectorProfile, ConnectorProvider,
    ConnectorStartResult, StateManager, UserContext,
};
use crate::config::PlatformConfig;
use crate::identity;

/// OAuth 2.0 provider for one platform.
///
/// The platform variant supplies endpoints and the profile format; the
/// configuration supplies client credentials and the callback URL.
pub struct OAuthConnector {
    platform: Platform,
    config: PlatformConfig,
    endpoints: Endpoints,
    scopes: Vec<String>,
    http: Client,
    states: StateManager,
    refresh_skew: Duration,
}

impl OAuthConnector {
    pub fn new(
        platform: Platform,
        config: PlatformConfig,
        states: StateManager,
        http: Client,
        refresh_skew_seconds: i64,
    ) -> Self {
        let endpoints = platform.endpoints(&config);
        let scopes = config.scopes.clone().unwrap_or_else(|| {
            platform
                .default_scopes()
                .iter()
                .map(|s| s.to_string())
                .collect()
        });

        Self {
            platform,
            config,
            endpoints,
            scopes,
            http,
            states,
            refresh_skew: Duration::seconds(refresh_skew_seconds),
        }
    }

    fn transport(&self, reason: String) -> ConnectorError {
        ConnectorError::Transport {
            platform: self.platform.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl ConnectorProvider for OAuthConnector {
    fn platform(&self) -> &str {
        self.platform.as_str()
    }

    fn provider_name(&self) -> &str {
        self.platform.provider_name()
    }

    fn start(&self, user: &UserContext) -> Result<ConnectorStartResult, ConnectorError> {
        let redirect_uri = user
            .redirect_uri
            .clone()
            .unwrap_or_else(|| self.config.redirect_uri.clone());

        let state = self
            .states
            .issue(self.platform.as_str(), &user.user_id, Some(redirect_uri.clone()));

        let connect_url = self.platform.build_auth_url(
            &self.endpoints.auth_url,
            &self.config.client_id,
            &self.scopes,
            &redirect_uri,
            &state,
        );

        info!(
            platform = %self.platform,
            user_id = %user.user_id,
            "Issued OAuth connect URL"
        );

        Ok(ConnectorStartResult {
            platform: self.platform.to_string(),
            connect_url,
            state,
            provider: self.provider_name().to_string(),
        })
    }

    async fn complete(
        &self,
        payload: &ConnectorCallbackPayload,
    ) -> Result<ConnectorProfile, ConnectorError> {
        debug!(platform = %self.platform, "OAuth callback received");

        if Platform::parse(&payload.platform) != Some(self.platform) {
            warn!(
                expected = %self.platform,
                actual = %payload.platform,
                "Callback routed to the wrong provider"
            );
            return Err(ConnectorError::InvalidState);
        }

        // Consume first: a state token is burned even if the rest fails
        let entry = self
            .states
            .consume(&payload.state, self.platform.as_str())
            .map_err(|e| {
                warn!(platform = %self.platform, "Invalid or expired OAuth state");
                e
            })?;

        if let Some(user_id) = &payload.user_id {
            if *user_id != entry.user_id {
                warn!(
                    platform = %self.platform,
                    expected = %entry.user_id,
                    actual = %user_id,
                    "OAuth state issued for a different user"
                );
                return Err(ConnectorError::InvalidState);
            }
        }

        if payload.code.is_empty() {
            return Err(ConnectorError::Exchange {
                platform: self.platform.to_string(),
                reason: "missing authorization code".to_string(),
            });
        }

        let redirect_uri = payload
            .redirect_uri
            .clone()
            .or(entry.redirect_uri)
            .unwrap_or_else(|| self.config.redirect_uri.clone());

        let form = [
            ("grant_type", "authorization_code"),
            ("code", payload.code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            (self.platform.client_id_param(), self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let tokens = exchange::request_token(&self.http, &self.endpoints.token_url, &form)
            .await
            .map_err(|e| match e {
                CallError::Transient(reason) => self.transport(reason),
                CallError::Rejected(reason) => ConnectorError::Exchange {
                    platform: self.platform.to_string(),
                    reason,
                },
            })?;

        let body = exchange::fetch_profile(&self.http, &self.endpoints.profile_url, &tokens.access_token)
            .await
            .map_err(|e| match e {
                CallError::Transient(reason) => self.transport(reason),
                CallError::Rejected(reason) => ConnectorError::Profile {
                    platform: self.platform.to_string(),
                    reason,
                },
            })?;

        let fetched = self
            .platform
            .parse_profile(&body)
            .map_err(|reason| ConnectorError::Profile {
                platform: self.platform.to_string(),
                reason,
            })?;

        let mut metadata: BTreeMap<String, String> = fetched.extra;
        metadata.insert("user_id".to_string(), entry.user_id.clone());
        if !payload.email.is_empty() {
            metadata.insert("email".to_string(), payload.email.clone());
        }
        if let Some(open_id) = tokens.open_id {
            metadata.insert("open_id".to_string(), open_id);
        }

        let mut handle = identity::to_handle(&fetched.username);
        if handle.is_empty() {
            handle = identity::to_handle(payload.name.as_deref().unwrap_or_default());
        }

        let display_name = fetched
            .display_name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| payload.name.clone())
            .unwrap_or_else(|| fetched.username.clone());

        let profile = ConnectorProfile {
            platform: self.platform.to_string(),
            platform_user_id: fetched.id,
            handle,
            display_name,
            follower_count: fetched.follower_count,
            profile_picture_url: fetched.picture_url.or_else(|| payload.picture.clone()),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_expires_at: tokens.expires_at,
            scope: tokens.scope,
            provider: self.provider_name().to_string(),
            metadata,
        };

        info!(
            platform = %self.platform,
            user_id = %entry.user_id,
            handle = %profile.handle,
            has_refresh_token = profile.refresh_token.is_some(),
            "OAuth flow completed successfully"
        );

        Ok(profile)
    }

    async fn refresh(&self, profile: &ConnectorProfile) -> Result<ConnectorProfile, ConnectorError> {
        let refresh_failed = |reason: String| ConnectorError::TokenRefreshFailed {
            platform: self.platform.to_string(),
            reason,
        };

        if Platform::parse(&profile.platform) != Some(self.platform) {
            return Err(refresh_failed(format!(
                "profile belongs to '{}'",
                profile.platform
            )));
        }

        if !profile.expires_within(self.refresh_skew, Utc::now()) {
            return Ok(profile.clone());
        }

        let refresh_token = profile
            .refresh_token
            .as_deref()
            .ok_or_else(|| refresh_failed("no refresh token stored".to_string()))?;

        info!(
            platform = %self.platform,
            platform_user_id = %profile.platform_user_id,
            "Refreshing OAuth token"
        );

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            (self.platform.client_id_param(), self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let tokens = exchange::request_token(&self.http, &self.endpoints.token_url, &form)
            .await
            .map_err(|e| match e {
                CallError::Transient(reason) => self.transport(reason),
                CallError::Rejected(reason) => {
                    warn!(platform = %self.platform, reason = %reason, "Refresh token rejected");
                    refresh_failed(reason)
                }
            })?;

        // Keep the existing refresh token if the platform did not rotate it
        Ok(ConnectorProfile {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or_else(|| profile.refresh_token.clone()),
            token_expires_at: tokens.expires_at,
            scope: tokens.scope.or_else(|| profile.scope.clone()),
            ..profile.clone()
        })
    }
}
