//! OAuth token exchange logic.
//!
//! Exchanges authorization codes and refresh tokens at a platform's token
//! endpoint, and fetches the authenticated profile.

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

/// How a platform call failed
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CallError {
    /// Timeout, connection error, 429 or 5xx
    Transient(String),
    /// The platform answered and said no (or answered garbage)
    Rejected(String),
}

/// OAuth token response (standard OAuth 2.0, plus TikTok's `open_id`)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    open_id: Option<String>,
}

/// Tokens returned by a successful exchange
#[derive(Debug, Clone)]
pub(crate) struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub open_id: Option<String>,
}

/// POST a form to the token endpoint and read the token response
///
/// Used for both `authorization_code` and `refresh_token` grants; the caller
/// supplies the grant-specific fields.
pub(crate) async fn request_token(
    client: &Client,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<TokenSet, CallError> {
    let grant_type = form
        .iter()
        .find(|(key, _)| *key == "grant_type")
        .map(|(_, value)| *value)
        .unwrap_or("unknown");
    tracing::debug!(grant_type = %grant_type, "Requesting token at {}", token_url);

    let response = client
        .post(token_url)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await
        .map_err(transport_error)?;

    let response = check_status(response).await?;

    let token_response: TokenResponse = response
        .json()
        .await
        .map_err(|e| CallError::Rejected(format!("Failed to parse token response: {}", e)))?;

    tracing::debug!(
        has_refresh_token = token_response.refresh_token.is_some(),
        expires_in = ?token_response.expires_in,
        "Token request successful"
    );

    let expires_at = token_response.expires_in.and_then(expiry_from_now);

    Ok(TokenSet {
        access_token: token_response.access_token,
        refresh_token: token_response.refresh_token,
        expires_at,
        scope: token_response.scope,
        open_id: token_response.open_id,
    })
}

/// Absolute expiry for a relative `expires_in`.
///
/// Negative values mean already expired; values past chrono's range mean no
/// usable expiry.
fn expiry_from_now(seconds: i64) -> Option<DateTime<Utc>> {
    let lifetime = Duration::try_seconds(seconds.max(0))?;
    Utc::now().checked_add_signed(lifetime)
}

/// GET the profile endpoint with a bearer token and return the raw body
pub(crate) async fn fetch_profile(
    client: &Client,
    profile_url: &str,
    access_token: &str,
) -> Result<String, CallError> {
    let response = client
        .get(profile_url)
        .bearer_auth(access_token)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(transport_error)?;

    let response = check_status(response).await?;

    response
        .text()
        .await
        .map_err(|e| CallError::Transient(format!("Failed to read profile body: {}", e)))
}

fn transport_error(e: reqwest::Error) -> CallError {
    if e.is_timeout() {
        CallError::Transient(format!("Request timed out: {}", e))
    } else {
        CallError::Transient(format!("Request failed: {}", e))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());

    if is_retryable(status) {
        Err(CallError::Transient(format!("status {}: {}", status, body)))
    } else {
        Err(CallError::Rejected(format!("status {}: {}", status, body)))
    }
}

pub(crate) fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}
