//! Account model representing one connected mailbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::BackfillProgress;

/// Mail provider backing an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Outlook => "outlook",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gmail" => Ok(Provider::Gmail),
            "outlook" => Ok(Provider::Outlook),
            other => anyhow::bail!("Unknown provider: {}", other),
        }
    }
}

/// Lifecycle status of an account
///
/// `Syncing` is the advisory in-flight marker; `Expired` and `Revoked` are
/// excluded from scheduled work until the user reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Syncing,
    Expired,
    Revoked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Syncing => "syncing",
            AccountStatus::Expired => "expired",
            AccountStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "syncing" => Ok(AccountStatus::Syncing),
            "expired" => Ok(AccountStatus::Expired),
            "revoked" => Ok(AccountStatus::Revoked),
            other => anyhow::bail!("Unknown account status: {}", other),
        }
    }
}

/// A connected mailbox owned by an organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Unique integer identifier (database primary key)
    pub id: i64,
    /// Organization that added the account
    pub org_id: i64,
    pub provider: Provider,
    /// Mailbox address
    pub email: String,
    pub display_name: Option<String>,
    pub status: AccountStatus,
    /// Encrypted OAuth access token
    pub encrypted_access_token: String,
    /// Encrypted OAuth refresh token
    pub encrypted_refresh_token: String,
    /// When the access token expires
    pub token_expires_at: DateTime<Utc>,
    /// Provider-opaque change cursor (Gmail historyId, Graph deltaLink)
    pub sync_cursor: Option<String>,
    pub backfill_progress: BackfillProgress,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Whether scheduled work may pick this account up
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Whether the token expires within `horizon` of `now`
    pub fn token_expires_within(&self, now: DateTime<Utc>, horizon: chrono::Duration) -> bool {
        self.token_expires_at <= now + horizon
    }
}

/// Data required to insert a new account (created on OAuth callback)
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub org_id: i64,
    pub provider: Provider,
    pub email: String,
    pub display_name: Option<String>,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
}

impl NewAccount {
    /// Create a new account record with empty credentials
    pub fn new(org_id: i64, provider: Provider, email: impl Into<String>) -> Self {
        Self {
            org_id,
            provider,
            email: email.into(),
            display_name: None,
            encrypted_access_token: String::new(),
            encrypted_refresh_token: String::new(),
            token_expires_at: Utc::now(),
        }
    }

    /// Set the encrypted credential pair and its expiry
    pub fn with_tokens(
        mut self,
        encrypted_access_token: impl Into<String>,
        encrypted_refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        self.encrypted_access_token = encrypted_access_token.into();
        self.encrypted_refresh_token = encrypted_refresh_token.into();
        self.token_expires_at = expires_at;
        self
    }

    /// Set display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}
