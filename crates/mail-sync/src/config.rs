//! Configuration loading for the sync engine
//!
//! OAuth client credentials are loaded from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file (~/.config/mailsync/credentials.json)
//! 3. Runtime environment variables (fallback)
//!
//! Engine tuning lives in ~/.config/mailsync/sync.json; every field is optional.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::BackfillPhase;
use crate::provider::http::RetryPolicy;

/// Credentials filename in the mailsync config directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Tuning filename in the mailsync config directory
pub const SYNC_CONFIG_FILE: &str = "sync.json";

/// Environment variable holding the base64 token-encryption key
pub const TOKEN_KEY_ENV: &str = "MAILSYNC_TOKEN_KEY";

/// OAuth client registration for one provider
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OAuthClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Microsoft tenant (`common`, `organizations` or a tenant id)
    #[serde(default)]
    pub tenant: Option<String>,
}

impl OAuthClientCredentials {
    fn new(client_id: &str, client_secret: &str) -> Option<Self> {
        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }
        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            tenant: None,
        })
    }

    fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant.filter(|t| !t.is_empty());
        self
    }

    /// Tenant for Microsoft token requests
    pub fn tenant_or_common(&self) -> &str {
        self.tenant.as_deref().unwrap_or("common")
    }
}

/// OAuth client credentials for every provider, plus the token-encryption key
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub google: Option<OAuthClientCredentials>,
    pub microsoft: Option<OAuthClientCredentials>,
    /// Base64-encoded 32-byte key for encrypting stored tokens
    pub token_key: Option<String>,
}

/// On-disk credentials file format
#[derive(Debug, Default, Deserialize)]
struct CredentialFile {
    google: Option<OAuthClientCredentials>,
    microsoft: Option<OAuthClientCredentials>,
    token_key: Option<String>,
}

impl ProviderCredentials {
    /// Load credentials, taking each provider from the highest-priority
    /// source that defines it.
    pub fn load() -> Result<Self> {
        let mut creds = Self::from_compile_time();

        if config::config_exists(CREDENTIALS_FILE) {
            let file: CredentialFile = config::load_json(CREDENTIALS_FILE)?;
            creds = creds.or(Self::from_credential_file(file));
        }

        Ok(creds.or(Self::from_env()))
    }

    /// Load credentials embedded at compile time via environment variables.
    /// Build with: GOOGLE_CLIENT_ID=xxx GOOGLE_CLIENT_SECRET=yyy cargo build --release
    pub fn from_compile_time() -> Self {
        let google = match (option_env!("GOOGLE_CLIENT_ID"), option_env!("GOOGLE_CLIENT_SECRET")) {
            (Some(id), Some(secret)) => OAuthClientCredentials::new(id, secret),
            _ => None,
        };
        let microsoft = match (
            option_env!("MICROSOFT_CLIENT_ID"),
            option_env!("MICROSOFT_CLIENT_SECRET"),
        ) {
            (Some(id), Some(secret)) => OAuthClientCredentials::new(id, secret)
                .map(|c| c.with_tenant(option_env!("MICROSOFT_TENANT").map(str::to_string))),
            _ => None,
        };

        Self {
            google,
            microsoft,
            token_key: None,
        }
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let file: CredentialFile = config::load_json_file(path)?;
        Ok(Self::from_credential_file(file))
    }

    /// Parse credentials from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Ok(Self::from_credential_file(file))
    }

    fn from_credential_file(file: CredentialFile) -> Self {
        let valid = |c: OAuthClientCredentials| {
            (!c.client_id.is_empty() && !c.client_secret.is_empty()).then_some(c)
        };
        Self {
            google: file.google.and_then(valid),
            microsoft: file.microsoft.and_then(valid),
            token_key: file.token_key.filter(|k| !k.is_empty()),
        }
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let google = match (var("GOOGLE_CLIENT_ID"), var("GOOGLE_CLIENT_SECRET")) {
            (Some(id), Some(secret)) => OAuthClientCredentials::new(&id, &secret),
            _ => None,
        };
        let microsoft = match (var("MICROSOFT_CLIENT_ID"), var("MICROSOFT_CLIENT_SECRET")) {
            (Some(id), Some(secret)) => {
                OAuthClientCredentials::new(&id, &secret).map(|c| c.with_tenant(var("MICROSOFT_TENANT")))
            }
            _ => None,
        };

        Self {
            google,
            microsoft,
            token_key: var(TOKEN_KEY_ENV),
        }
    }

    /// Fill anything missing here from `fallback`
    fn or(self, fallback: Self) -> Self {
        Self {
            google: self.google.or(fallback.google),
            microsoft: self.microsoft.or(fallback.microsoft),
            token_key: self.token_key.or(fallback.token_key),
        }
    }

    /// Get the default credentials file path (~/.config/mailsync/credentials.json)
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

/// Engine tuning; every field falls back to its default when absent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often the daemon runs the incremental sync sweep
    pub sync_interval_secs: u64,
    /// Accounts synced more recently than this are skipped
    pub min_sync_interval_secs: u64,
    /// How often the token refresh sweep runs
    pub token_refresh_interval_secs: u64,
    /// Tokens expiring within this window are refreshed proactively
    pub token_refresh_horizon_secs: u64,
    /// Concurrent thread fetches during incremental sync
    pub incremental_concurrency: usize,
    pub incremental_batch_delay_ms: u64,
    /// Pause between fetch windows, per backfill phase
    pub phase_batch_delay_ms: HashMap<BackfillPhase, u64>,
    /// Attempts per backfill phase before the chain gives up
    pub max_phase_attempts: u32,
    pub retry: RetryPolicy,
    pub client_cache_ttl_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 300,
            min_sync_interval_secs: 300,
            token_refresh_interval_secs: 300,
            token_refresh_horizon_secs: 600,
            incremental_concurrency: 10,
            incremental_batch_delay_ms: 0,
            phase_batch_delay_ms: HashMap::new(),
            max_phase_attempts: 3,
            retry: RetryPolicy::default(),
            client_cache_ttl_secs: 1800,
            http_timeout_secs: 60,
        }
    }
}

impl SyncConfig {
    /// Load ~/.config/mailsync/sync.json, or defaults when it does not exist
    pub fn load() -> Result<Self> {
        config::load_json_or_default(SYNC_CONFIG_FILE)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn min_sync_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_sync_interval_secs as i64)
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval_secs)
    }

    pub fn token_refresh_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_horizon_secs as i64)
    }

    pub fn client_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.client_cache_ttl_secs as i64)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Configured inter-window delay for a phase, if overridden
    pub fn phase_batch_delay(&self, phase: BackfillPhase) -> Option<Duration> {
        self.phase_batch_delay_ms
            .get(&phase)
            .map(|ms| Duration::from_millis(*ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credentials_file() {
        let json = r#"{
            "google": {"client_id": "g-id", "client_secret": "g-secret"},
            "microsoft": {"client_id": "m-id", "client_secret": "m-secret", "tenant": "contoso"},
            "token_key": "a2V5"
        }"#;

        let creds = ProviderCredentials::from_json(json).unwrap();
        assert_eq!(creds.google.as_ref().unwrap().client_id, "g-id");
        let microsoft = creds.microsoft.unwrap();
        assert_eq!(microsoft.tenant_or_common(), "contoso");
        assert_eq!(creds.token_key.as_deref(), Some("a2V5"));
    }

    #[test]
    fn test_empty_entries_are_ignored() {
        let json = r#"{"google": {"client_id": "", "client_secret": "x"}}"#;
        let creds = ProviderCredentials::from_json(json).unwrap();
        assert!(creds.google.is_none());
        assert!(creds.microsoft.is_none());
    }

    #[test]
    fn test_invalid_json() {
        assert!(ProviderCredentials::from_json("{ not json").is_err());
    }

    #[test]
    fn test_earlier_source_wins() {
        let primary = ProviderCredentials {
            google: OAuthClientCredentials::new("first", "s"),
            ..Default::default()
        };
        let fallback = ProviderCredentials {
            google: OAuthClientCredentials::new("second", "s"),
            microsoft: OAuthClientCredentials::new("ms", "s"),
            token_key: Some("k".to_string()),
        };

        let merged = primary.or(fallback);
        assert_eq!(merged.google.unwrap().client_id, "first");
        assert_eq!(merged.microsoft.unwrap().tenant_or_common(), "common");
        assert_eq!(merged.token_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_sync_config_partial_file() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"min_sync_interval_secs": 60, "phase_batch_delay_ms": {"archive": 250}}"#,
        )
        .unwrap();
        assert_eq!(config.min_sync_interval(), chrono::Duration::seconds(60));
        assert_eq!(config.sync_interval_secs, 300);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(
            config.phase_batch_delay(BackfillPhase::Archive),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.phase_batch_delay(BackfillPhase::Priority), None);
    }
}
