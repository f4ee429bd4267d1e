//! Provider failure taxonomy shared by every provider client

use std::time::Duration;

/// Errors surfaced uniformly by provider clients, whatever the provider
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Credentials were rejected; the account must be reconnected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Quota exceeded; retry after the hinted delay when present
    #[error("Rate limited by provider: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// The thread or message no longer exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other provider or transport fault
    #[error("Provider error{}: {message}", status_suffix(.status))]
    Provider {
        status: Option<u16>,
        message: String,
    },
}

impl ProviderError {
    pub fn provider(message: impl Into<String>) -> Self {
        ProviderError::Provider {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the same request may succeed if sent again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Provider { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Authentication(_))
    }

    /// Provider-supplied retry hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        let message = truncate_body(body);
        match status {
            // Gmail reports per-user quota exhaustion as 403
            403 if is_quota_body(body) => ProviderError::RateLimited {
                retry_after,
                message,
            },
            401 | 403 => ProviderError::Authentication(message),
            404 | 410 => ProviderError::NotFound(message),
            429 => ProviderError::RateLimited {
                retry_after,
                message,
            },
            _ => ProviderError::Provider {
                status: Some(status),
                message,
            },
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::provider(format!("Failed to parse provider response: {}", e))
    }
}

fn is_quota_body(body: &str) -> bool {
    ["rateLimitExceeded", "userRateLimitExceeded", "quotaExceeded"]
        .iter()
        .any(|reason| body.contains(reason))
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

/// Keep error messages short; provider bodies can be large HTML pages
fn truncate_body(body: &str) -> String {
    const MAX_LEN: usize = 300;
    let body = body.trim();
    if body.len() <= MAX_LEN {
        return body.to_string();
    }
    let mut end = MAX_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
