//! OAuth token state shared by provider clients

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use super::http::{HttpRequest, HttpResponse, HttpTransport, execute};
use super::ProviderError;
use crate::clock::Clock;

/// Tokens are refreshed this long before they actually expire
pub const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// A decrypted OAuth credential pair
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - chrono::Duration::minutes(REFRESH_MARGIN_MINUTES)
    }
}

// Keep secrets out of logs
impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token endpoint and client credentials for one provider
#[derive(Debug, Clone)]
pub struct OAuthEndpoint {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// In-memory token state for a single client, refreshed on demand
pub struct TokenManager {
    state: Mutex<TokenSet>,
    endpoint: OAuthEndpoint,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    /// Serializes refreshes so concurrent requests trigger at most one
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(
        tokens: TokenSet,
        endpoint: OAuthEndpoint,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(tokens),
            endpoint,
            transport,
            clock,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot of the current token pair
    pub fn current(&self) -> TokenSet {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn needs_refresh(&self) -> bool {
        self.current().needs_refresh(self.clock.now())
    }

    /// A usable access token, refreshing first if it is about to expire
    pub async fn access_token(&self) -> Result<String, ProviderError> {
        if !self.needs_refresh() {
            return Ok(self.current().access_token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another request may have refreshed while we waited
        if !self.needs_refresh() {
            return Ok(self.current().access_token);
        }
        Ok(self.refresh_locked().await?.access_token)
    }

    /// Exchange the refresh token for a new access token
    pub async fn refresh(&self) -> Result<TokenSet, ProviderError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<TokenSet, ProviderError> {
        let refresh_token = self.current().refresh_token;
        if refresh_token.is_empty() {
            return Err(ProviderError::Authentication(
                "No refresh token available".to_string(),
            ));
        }

        let mut form = vec![
            ("client_id".to_string(), self.endpoint.client_id.clone()),
            ("client_secret".to_string(), self.endpoint.client_secret.clone()),
            ("refresh_token".to_string(), refresh_token.clone()),
            ("grant_type".to_string(), "refresh_token".to_string()),
        ];
        if let Some(scope) = &self.endpoint.scope {
            form.push(("scope".to_string(), scope.clone()));
        }

        let response = execute(
            self.transport.clone(),
            HttpRequest::post_form(&self.endpoint.token_url, form),
        )
        .await?;

        if !response.is_success() {
            let error = classify_token_error(&response);
            warn!("[AUTH] Token refresh failed: {}", error);
            return Err(error);
        }

        let parsed: TokenResponse = response.json()?;
        let expires_in = parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let tokens = TokenSet {
            access_token: parsed.access_token,
            // Preserve the refresh token if not returned
            refresh_token: parsed
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or(refresh_token),
            expires_at: self.clock.now() + chrono::Duration::seconds(expires_in),
        };

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = tokens.clone();
        info!("[AUTH] Access token refreshed, expires at {}", tokens.expires_at);
        Ok(tokens)
    }
}

/// A rejected refresh token means the account must be reconnected
fn classify_token_error(response: &HttpResponse) -> ProviderError {
    let parsed: TokenErrorResponse = serde_json::from_str(&response.body).unwrap_or_default();
    let code = parsed.error.unwrap_or_default();
    let description = parsed.error_description.unwrap_or_default();

    if code == "invalid_grant" || matches!(response.status, 400 | 401) {
        let message = if description.is_empty() {
            format!("Refresh token rejected ({})", code)
        } else {
            format!("Refresh token rejected ({}): {}", code, description)
        };
        return ProviderError::Authentication(message);
    }

    ProviderError::from_status(response.status, response.retry_after, &response.body)
}
