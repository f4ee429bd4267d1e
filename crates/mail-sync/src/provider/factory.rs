//! Construction of provider clients from stored accounts

use anyhow::{Context, Result};
use std::sync::Arc;

use super::http::{HttpTransport, RetryPolicy};
use super::token::{OAuthEndpoint, TokenManager, TokenSet};
use super::{ApiSession, ProviderClient};
use crate::clock::Clock;
use crate::config::ProviderCredentials;
use crate::gmail::GmailClient;
use crate::models::{Account, Provider};
use crate::outlook::OutlookClient;

/// Builds the client for an account. This is the only place that branches
/// on the provider.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, account: &Account, tokens: TokenSet) -> Result<Arc<dyn ProviderClient>>;
}

/// Factory producing real Gmail and Outlook clients
pub struct DefaultProviderFactory {
    transport: Arc<dyn HttpTransport>,
    credentials: ProviderCredentials,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl DefaultProviderFactory {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: ProviderCredentials,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            credentials,
            clock,
            retry,
        }
    }

    fn session(&self, tokens: TokenSet, endpoint: OAuthEndpoint) -> ApiSession {
        let manager = TokenManager::new(tokens, endpoint, self.transport.clone(), self.clock.clone());
        ApiSession::new(self.transport.clone(), manager, self.retry.clone())
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, account: &Account, tokens: TokenSet) -> Result<Arc<dyn ProviderClient>> {
        match account.provider {
            Provider::Gmail => {
                let creds = self
                    .credentials
                    .google
                    .as_ref()
                    .context("Google OAuth credentials are not configured")?;
                let endpoint = OAuthEndpoint {
                    token_url: GmailClient::TOKEN_URL.to_string(),
                    client_id: creds.client_id.clone(),
                    client_secret: creds.client_secret.clone(),
                    scope: None,
                };
                let session = self.session(tokens, endpoint);
                Ok(Arc::new(GmailClient::new(session, &account.email)))
            }
            Provider::Outlook => {
                let creds = self
                    .credentials
                    .microsoft
                    .as_ref()
                    .context("Microsoft OAuth credentials are not configured")?;
                let endpoint = OAuthEndpoint {
                    token_url: OutlookClient::token_url(creds.tenant_or_common()),
                    client_id: creds.client_id.clone(),
                    client_secret: creds.client_secret.clone(),
                    scope: Some(OutlookClient::SCOPE.to_string()),
                };
                // Immutable ids survive folder moves, keeping dedup keys stable
                let session = self
                    .session(tokens, endpoint)
                    .with_header("Prefer", "IdType=\"ImmutableId\"");
                Ok(Arc::new(OutlookClient::new(session, &account.email)))
            }
        }
    }
}
