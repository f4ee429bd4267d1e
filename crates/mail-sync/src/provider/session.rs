//! Authorized request path shared by the Gmail and Outlook clients

use log::warn;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::http::{HttpRequest, HttpResponse, HttpTransport, RetryPolicy, execute, with_retry};
use super::token::{TokenManager, TokenSet};
use super::ProviderError;

/// Bearer-authenticated GETs with token freshness and retries
pub struct ApiSession {
    transport: Arc<dyn HttpTransport>,
    tokens: TokenManager,
    retry: RetryPolicy,
    /// Extra headers sent with every request
    headers: Vec<(String, String)>,
}

impl ApiSession {
    pub fn new(transport: Arc<dyn HttpTransport>, tokens: TokenManager, retry: RetryPolicy) -> Self {
        Self {
            transport,
            tokens,
            retry,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn current_tokens(&self) -> TokenSet {
        self.tokens.current()
    }

    /// GET `url`, returning the 2xx response or the classified error.
    ///
    /// A 401 on an apparently fresh token triggers one forced refresh before
    /// giving up, since providers can revoke access tokens early.
    pub async fn get(&self, url: &str) -> Result<HttpResponse, ProviderError> {
        let mut refreshed = false;
        loop {
            let result = with_retry(&self.retry, url, move || self.send_once(url)).await;
            match result {
                Err(ProviderError::Authentication(message)) if !refreshed => {
                    warn!("[HTTP] Access token rejected ({}), forcing refresh", message);
                    self.tokens.refresh().await?;
                    refreshed = true;
                }
                other => return other,
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        self.get(url).await?.json()
    }

    async fn send_once(&self, url: &str) -> Result<HttpResponse, ProviderError> {
        let token = self.tokens.access_token().await?;
        let mut request = HttpRequest::get(url).bearer(token);
        for (name, value) in &self.headers {
            request = request.header(name.clone(), value.clone());
        }
        execute(self.transport.clone(), request)
            .await?
            .error_for_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::provider::fake::FakeTransport;
    use crate::provider::token::OAuthEndpoint;
    use chrono::Utc;

    fn session(transport: Arc<FakeTransport>) -> ApiSession {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tokens = TokenManager::new(
            TokenSet::new("access", "refresh", clock.now() + chrono::Duration::hours(1)),
            OAuthEndpoint {
                token_url: "https://auth.example.com/token".to_string(),
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                scope: None,
            },
            transport.clone(),
            clock,
        );
        ApiSession::new(transport, tokens, RetryPolicy::none()).with_header("Prefer", "test")
    }

    #[tokio::test]
    async fn test_get_sends_bearer_and_headers() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond("/api/me", HttpResponse::new(200, r#"{"ok":true}"#));

        let value: serde_json::Value = session(transport.clone())
            .get_json("https://api.example.com/api/me")
            .await
            .unwrap();
        assert_eq!(value["ok"], true);

        let request = &transport.requests()[0];
        assert_eq!(request.bearer.as_deref(), Some("access"));
        assert!(request.headers.contains(&("Prefer".to_string(), "test".to_string())));
    }

    #[tokio::test]
    async fn test_unauthorized_forces_one_refresh() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond("/api/me", HttpResponse::new(401, "expired"));
        transport.respond("/token", HttpResponse::new(200, r#"{"access_token":"renewed"}"#));
        transport.respond("/api/me", HttpResponse::new(200, "{}"));

        let session = session(transport.clone());
        session.get("https://api.example.com/api/me").await.unwrap();

        assert_eq!(session.current_tokens().access_token, "renewed");
        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].bearer.as_deref(), Some("renewed"));
    }

    #[tokio::test]
    async fn test_not_found_is_returned() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond("/api/thing", HttpResponse::new(404, "missing"));

        let err = session(transport)
            .get("https://api.example.com/api/thing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
