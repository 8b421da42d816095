//! Connected-account storage.
//!
//! Keeps the latest [`ConnectorProfile`] per (user, platform) so background
//! jobs can act on a user's behalf. Tokens are sealed with AES-256-GCM before
//! they reach SQLite; everything else is stored in the clear.
//!
//! A new profile for the same (user, platform) supersedes the old row.

mod cipher;

pub use cipher::{SealedToken, TokenCipher};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::connectors::ConnectorProfile;

/// Encrypted account storage backed by SQLite.
pub struct AccountStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

impl AccountStore {
    /// Creates or opens the store.
    ///
    /// # Arguments
    /// * `db_path` - SQLite file (":memory:" for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn open<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher = TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;
        let conn = Connection::open(db_path).context("Failed to open accounts database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                user_id              TEXT NOT NULL,
                platform             TEXT NOT NULL,
                platform_user_id     TEXT NOT NULL,
                handle               TEXT NOT NULL,
                display_name         TEXT NOT NULL,
                follower_count       INTEGER NOT NULL,
                profile_picture_url  TEXT,
                access_token         TEXT NOT NULL,
                access_token_nonce   TEXT NOT NULL,
                refresh_token        TEXT,
                refresh_token_nonce  TEXT,
                token_expires_at     TEXT,
                scope                TEXT,
                provider             TEXT NOT NULL,
                metadata             TEXT NOT NULL,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL,
                PRIMARY KEY (user_id, platform)
            );
            "#,
        )
        .context("Failed to create accounts table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("accounts connection mutex poisoned"))
    }

    /// Store the profile for `user_id`, replacing any earlier one for the platform.
    pub fn save(&self, user_id: &str, profile: &ConnectorProfile) -> Result<()> {
        let access = self
            .cipher
            .seal(&profile.access_token)
            .context("Failed to encrypt access token")?;
        let refresh = profile
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.seal(token))
            .transpose()
            .context("Failed to encrypt refresh token")?;
        let metadata =
            serde_json::to_string(&profile.metadata).context("Failed to serialize metadata")?;
        let now = Utc::now().to_rfc3339();

        self.conn()?
            .execute(
                r#"
                INSERT INTO accounts (
                    user_id, platform, platform_user_id, handle, display_name,
                    follower_count, profile_picture_url,
                    access_token, access_token_nonce,
                    refresh_token, refresh_token_nonce,
                    token_expires_at, scope, provider, metadata,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
                ON CONFLICT(user_id, platform) DO UPDATE SET
                    platform_user_id = excluded.platform_user_id,
                    handle = excluded.handle,
                    display_name = excluded.display_name,
                    follower_count = excluded.follower_count,
                    profile_picture_url = excluded.profile_picture_url,
                    access_token = excluded.access_token,
                    access_token_nonce = excluded.access_token_nonce,
                    refresh_token = excluded.refresh_token,
                    refresh_token_nonce = excluded.refresh_token_nonce,
                    token_expires_at = excluded.token_expires_at,
                    scope = excluded.scope,
                    provider = excluded.provider,
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user_id,
                    profile.platform,
                    profile.platform_user_id,
                    profile.handle,
                    profile.display_name,
                    profile.follower_count as i64,
                    profile.profile_picture_url,
                    access.ciphertext,
                    access.nonce,
                    refresh.as_ref().map(|s| s.ciphertext.as_str()),
                    refresh.as_ref().map(|s| s.nonce.as_str()),
                    profile.token_expires_at.map(|t| t.to_rfc3339()),
                    profile.scope,
                    profile.provider,
                    metadata,
                    now,
                ],
            )
            .context("Failed to store account")?;

        Ok(())
    }

    /// Load and decrypt the profile for (user, platform).
    pub fn get(&self, user_id: &str, platform: &str) -> Result<Option<ConnectorProfile>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT platform, platform_user_id, handle, display_name, follower_count,
                       profile_picture_url, access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce, token_expires_at,
                       scope, provider, metadata
                FROM accounts
                WHERE user_id = ?1 AND platform = ?2
                "#,
                params![user_id, platform],
                |row| {
                    Ok(StoredAccount {
                        platform: row.get(0)?,
                        platform_user_id: row.get(1)?,
                        handle: row.get(2)?,
                        display_name: row.get(3)?,
                        follower_count: row.get(4)?,
                        profile_picture_url: row.get(5)?,
                        access_token: SealedToken {
                            ciphertext: row.get(6)?,
                            nonce: row.get(7)?,
                        },
                        refresh_token: match (row.get::<_, Option<String>>(8)?, row.get::<_, Option<String>>(9)?) {
                            (Some(ciphertext), Some(nonce)) => Some(SealedToken { ciphertext, nonce }),
                            _ => None,
                        },
                        token_expires_at: row.get(10)?,
                        scope: row.get(11)?,
                        provider: row.get(12)?,
                        metadata: row.get(13)?,
                    })
                },
            )
            .optional()
            .context("Failed to query account")?;

        row.map(|stored| stored.into_profile(&self.cipher)).transpose()
    }

    /// Returns true if a row was removed.
    pub fn delete(&self, user_id: &str, platform: &str) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                "DELETE FROM accounts WHERE user_id = ?1 AND platform = ?2",
                params![user_id, platform],
            )
            .context("Failed to delete account")?;
        Ok(rows > 0)
    }

    /// Platforms connected for a user, sorted.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT platform FROM accounts WHERE user_id = ?1 ORDER BY platform")
            .context("Failed to prepare query")?;

        let platforms = stmt
            .query_map(params![user_id], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;

        Ok(platforms)
    }
}

/// Row as read from SQLite, tokens still sealed
struct StoredAccount {
    platform: String,
    platform_user_id: String,
    handle: String,
    display_name: String,
    follower_count: i64,
    profile_picture_url: Option<String>,
    access_token: SealedToken,
    refresh_token: Option<SealedToken>,
    token_expires_at: Option<String>,
    scope: Option<String>,
    provider: String,
    metadata: String,
}

impl StoredAccount {
    fn into_profile(self, cipher: &TokenCipher) -> Result<ConnectorProfile> {
        let access_token = cipher
            .open(&self.access_token)
            .context("Failed to decrypt access token")?;
        let refresh_token = self
            .refresh_token
            .as_ref()
            .map(|sealed| cipher.open(sealed))
            .transpose()
            .context("Failed to decrypt refresh token")?;
        let token_expires_at = self
            .token_expires_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
            .transpose()
            .context("Failed to parse token_expires_at")?;
        let metadata: BTreeMap<String, String> =
            serde_json::from_str(&self.metadata).context("Failed to parse metadata")?;

        Ok(ConnectorProfile {
            platform: self.platform,
            platform_user_id: self.platform_user_id,
            handle: self.handle,
            display_name: self.display_name,
            follower_count: self.follower_count.max(0) as u64,
            profile_picture_url: self.profile_picture_url,
            access_token,
            refresh_token,
            token_expires_at,
            scope: self.scope,
            provider: self.provider,
            metadata,
        })
    }
}
