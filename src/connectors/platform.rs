//! Platform table.
//!
//! Each supported platform is one variant; everything platform-specific
//! (endpoints, scopes, query parameter names, profile format) hangs off it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::PlatformConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    TikTok,
    YouTube,
}

/// OAuth and profile endpoints for a platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub auth_url: String,
    pub token_url: String,
    pub profile_url: String,
}

/// Platform profile reduced to the fields every connector reports
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PlatformProfile {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub follower_count: u64,
    pub picture_url: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Instagram, Platform::TikTok, Platform::YouTube];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
            Platform::YouTube => "youtube",
        }
    }

    /// Parse a platform key, ignoring case and surrounding whitespace
    pub fn parse(key: &str) -> Option<Self> {
        let key = key.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|p| p.as_str() == key)
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram-graph",
            Platform::TikTok => "tiktok-login-kit",
            Platform::YouTube => "google-oauth",
        }
    }

    pub fn default_endpoints(&self) -> Endpoints {
        let (auth_url, token_url, profile_url) = match self {
            Platform::Instagram => (
                "https://www.instagram.com/oauth/authorize",
                "https://api.instagram.com/oauth/access_token",
                "https://graph.instagram.com/me?fields=id,username,name,profile_picture_url,followers_count,account_type",
            ),
            Platform::TikTok => (
                "https://www.tiktok.com/v2/auth/authorize/",
                "https://open.tiktokapis.com/v2/oauth/token/",
                "https://open.tiktokapis.com/v2/user/info/?fields=open_id,username,display_name,avatar_url,follower_count",
            ),
            Platform::YouTube => (
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
                "https://www.googleapis.com/youtube/v3/channels?part=snippet,statistics&mine=true",
            ),
        };

        Endpoints {
            auth_url: auth_url.to_string(),
            token_url: token_url.to_string(),
            profile_url: profile_url.to_string(),
        }
    }

    /// Defaults with any configured overrides applied
    pub fn endpoints(&self, config: &PlatformConfig) -> Endpoints {
        let defaults = self.default_endpoints();
        Endpoints {
            auth_url: config.auth_url.clone().unwrap_or(defaults.auth_url),
            token_url: config.token_url.clone().unwrap_or(defaults.token_url),
            profile_url: config.profile_url.clone().unwrap_or(defaults.profile_url),
        }
    }

    pub fn default_scopes(&self) -> &'static [&'static str] {
        match self {
            Platform::Instagram => &["instagram_business_basic"],
            Platform::TikTok => &["user.info.basic", "user.info.profile", "user.info.stats"],
            Platform::YouTube => &["https://www.googleapis.com/auth/youtube.readonly"],
        }
    }

    fn scope_separator(&self) -> &'static str {
        match self {
            Platform::TikTok => ",",
            _ => " ",
        }
    }

    /// TikTok calls the client id `client_key`
    pub(crate) fn client_id_param(&self) -> &'static str {
        match self {
            Platform::TikTok => "client_key",
            _ => "client_id",
        }
    }

    fn extra_auth_params(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            // Google only hands out refresh tokens for offline access
            Platform::YouTube => &[("access_type", "offline"), ("prompt", "consent")],
            _ => &[],
        }
    }

    /// Build authorization URL with state and redirect_uri
    pub fn build_auth_url(
        &self,
        auth_url: &str,
        client_id: &str,
        scopes: &[String],
        redirect_uri: &str,
        state: &str,
    ) -> String {
        let scope = scopes.join(self.scope_separator());
        let separator = if auth_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}{}={}&redirect_uri={}&scope={}&state={}&response_type=code",
            auth_url,
            separator,
            self.client_id_param(),
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scope),
            urlencoding::encode(state)
        );
        for (key, value) in self.extra_auth_params() {
            url.push_str(&format!("&{}={}", key, urlencoding::encode(value)));
        }
        url
    }

    /// Read the platform's profile response
    pub(crate) fn parse_profile(&self, body: &str) -> Result<PlatformProfile, String> {
        match self {
            Platform::Instagram => {
                let me: InstagramMe = serde_json::from_str(body).map_err(|e| e.to_string())?;
                let mut extra = BTreeMap::new();
                if let Some(account_type) = me.account_type {
                    extra.insert("account_type".to_string(), account_type);
                }
                Ok(PlatformProfile {
                    id: me.id,
                    username: me.username,
                    display_name: me.name,
                    follower_count: me.followers_count.unwrap_or(0),
                    picture_url: me.profile_picture_url,
                    extra,
                })
            }
            Platform::TikTok => {
                let envelope: TikTokEnvelope =
                    serde_json::from_str(body).map_err(|e| e.to_string())?;
                let user = envelope.data.user;
                let mut extra = BTreeMap::new();
                extra.insert("open_id".to_string(), user.open_id.clone());
                Ok(PlatformProfile {
                    username: user.username.unwrap_or_default(),
                    id: user.open_id,
                    display_name: user.display_name,
                    follower_count: user.follower_count.unwrap_or(0),
                    picture_url: user.avatar_url,
                    extra,
                })
            }
            Platform::YouTube => {
                let list: ChannelList = serde_json::from_str(body).map_err(|e| e.to_string())?;
                let channel = list
                    .items
                    .into_iter()
                    .next()
                    .ok_or_else(|| "account has no YouTube channel".to_string())?;

                let follower_count = channel
                    .statistics
                    .and_then(|s| s.subscriber_count)
                    .and_then(|count| count.parse::<u64>().ok())
                    .unwrap_or(0);
                let picture_url = channel
                    .snippet
                    .thumbnails
                    .and_then(|t| t.high.or(t.default))
                    .map(|t| t.url);

                let mut extra = BTreeMap::new();
                if let Some(custom_url) = &channel.snippet.custom_url {
                    extra.insert("custom_url".to_string(), custom_url.clone());
                }
                Ok(PlatformProfile {
                    id: channel.id,
                    username: channel
                        .snippet
                        .custom_url
                        .unwrap_or_else(|| channel.snippet.title.clone()),
                    display_name: Some(channel.snippet.title),
                    follower_count,
                    picture_url,
                    extra,
                })
            }
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instagram Graph `/me`
#[derive(Deserialize)]
struct InstagramMe {
    id: String,
    username: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    profile_picture_url: Option<String>,
    #[serde(default)]
    followers_count: Option<u64>,
    #[serde(default)]
    account_type: Option<String>,
}

/// TikTok `/v2/user/info/`
#[derive(Deserialize)]
struct TikTokEnvelope {
    data: TikTokData,
}

#[derive(Deserialize)]
struct TikTokData {
    user: TikTokUser,
}

#[derive(Deserialize)]
struct TikTokUser {
    open_id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    follower_count: Option<u64>,
}

/// YouTube Data API `channels.list?mine=true`
#[derive(Deserialize)]
struct ChannelList {
    #[serde(default)]
    items: Vec<Channel>,
}

#[derive(Deserialize)]
struct Channel {
    id: String,
    snippet: ChannelSnippet,
    #[serde(default)]
    statistics: Option<ChannelStatistics>,
}

#[derive(Deserialize)]
struct ChannelSnippet {
    title: String,
    #[serde(rename = "customUrl", default)]
    custom_url: Option<String>,
    #[serde(default)]
    thumbnails: Option<Thumbnails>,
}

#[derive(Deserialize)]
struct Thumbnails {
    #[serde(default)]
    default: Option<Thumbnail>,
    #[serde(default)]
    high: Option<Thumbnail>,
}

#[derive(Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Deserialize)]
struct ChannelStatistics {
    // The API returns counts as strings
    #[serde(rename = "subscriberCount", default)]
    subscriber_count: Option<String>,
}
