//! Engine-level errors and the failure payload recorded on sync results

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::CipherError;
use crate::models::{AccountStatus, BackfillPhase};
use crate::provider::ProviderError;

/// Errors that abort a sync or backfill invocation
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Account {0} not found")]
    AccountNotFound(i64),

    /// Another run holds the account's `syncing` status
    #[error("A sync is already running for this account")]
    AlreadySyncing,

    #[error("Account is not eligible for sync (status: {status})")]
    NotEligible { status: AccountStatus },

    /// Incremental sync requested before any cursor was stored
    #[error("Account has no sync cursor; a backfill is required")]
    NoCursor,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A backfill phase ran past its wall-clock budget
    #[error("Backfill phase {0} exceeded its time budget")]
    PhaseTimeout(BackfillPhase),

    /// A backfill phase ended with threads still to retry
    #[error("Backfill phase {phase} left {failed} threads to retry")]
    PhaseIncomplete { phase: BackfillPhase, failed: usize },

    /// Stored tokens could not be decrypted or re-encrypted
    #[error("Credential error: {0}")]
    Credentials(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<CipherError> for SyncError {
    fn from(e: CipherError) -> Self {
        SyncError::Credentials(e.to_string())
    }
}

impl SyncError {
    /// Result-payload classification of this error
    pub fn code(&self) -> SyncErrorCode {
        match self {
            SyncError::NoCursor => SyncErrorCode::FullSyncRequired,
            SyncError::Provider(ProviderError::Authentication(_)) => {
                SyncErrorCode::AuthenticationFailed
            }
            SyncError::Provider(ProviderError::RateLimited { .. }) => SyncErrorCode::RateLimited,
            SyncError::Provider(_) => SyncErrorCode::ProviderFailure,
            SyncError::Credentials(_) => SyncErrorCode::AuthenticationFailed,
            _ => SyncErrorCode::Internal,
        }
    }

    pub fn to_failure(&self) -> SyncFailure {
        SyncFailure::new(self.code(), self.to_string())
    }
}

/// Machine-readable failure class carried in sync results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncErrorCode {
    /// The change cursor expired; the caller must start a backfill
    FullSyncRequired,
    /// Credentials are no longer valid; the user must reconnect
    AuthenticationFailed,
    RateLimited,
    ProviderFailure,
    Internal,
}

impl SyncErrorCode {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncErrorCode::FullSyncRequired | SyncErrorCode::AuthenticationFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::FullSyncRequired => "FULL_SYNC_REQUIRED",
            SyncErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            SyncErrorCode::RateLimited => "RATE_LIMITED",
            SyncErrorCode::ProviderFailure => "PROVIDER_FAILURE",
            SyncErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A top-level failure as reported to callers and stored in `last_sync_error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub code: SyncErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl SyncFailure {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }

    pub fn full_sync_required() -> Self {
        Self::new(
            SyncErrorCode::FullSyncRequired,
            "Change history expired; a full backfill is required",
        )
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
