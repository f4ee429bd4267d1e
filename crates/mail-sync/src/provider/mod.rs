//! Provider client abstraction
//!
//! Gmail and Outlook expose structurally different APIs. Each is wrapped in a
//! [`ProviderClient`] that yields threads with fully normalized messages plus
//! an opaque change cursor, so nothing above this module knows which provider
//! it is talking to.

pub mod address;
mod cache;
mod error;
mod factory;
pub mod http;
mod session;
pub mod token;

#[cfg(test)]
pub(crate) mod fake;

pub use cache::ClientCache;
pub use error::ProviderError;
pub use factory::{DefaultProviderFactory, ProviderFactory};
pub use session::ApiSession;
pub use token::TokenSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{MessageFlags, Provider, ProviderThread};

/// Basic mailbox profile, used for display only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub email: String,
    pub display_name: Option<String>,
    pub messages_total: Option<u64>,
    pub threads_total: Option<u64>,
}

/// Options for one `list_threads` page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListThreadsOptions {
    /// Requested page size; clients clamp to their maximum
    pub page_size: usize,
    /// Opaque token from the previous page
    pub page_token: Option<String>,
    /// Only threads with activity at or after this instant
    pub after: Option<DateTime<Utc>>,
    /// Only threads with activity before this instant
    pub before: Option<DateTime<Utc>>,
}

/// Lightweight listing entry; bodies are fetched separately
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRef {
    pub provider_thread_id: String,
    pub snippet: Option<String>,
}

impl ThreadRef {
    pub fn new(provider_thread_id: impl Into<String>) -> Self {
        Self {
            provider_thread_id: provider_thread_id.into(),
            snippet: None,
        }
    }
}

/// One page of a thread listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadPage {
    pub threads: Vec<ThreadRef>,
    pub next_page_token: Option<String>,
    pub result_size_estimate: Option<u64>,
}

/// Label/flag change for one message, applied without refetching the thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelUpdate {
    pub provider_thread_id: String,
    pub provider_message_id: String,
    /// Full current label set of the message
    pub labels: Vec<String>,
    pub flags: MessageFlags,
}

/// Result of reading a provider change feed from a cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Cursor to store for the next incremental sync
    pub new_cursor: Option<String>,
    /// Threads that gained messages or otherwise need a refetch
    pub changed_thread_ids: Vec<String>,
    /// Threads whose messages were deleted and that are not also changed
    pub deleted_thread_ids: Vec<String>,
    /// Label-only changes for threads not in `changed_thread_ids`
    pub label_updates: Vec<LabelUpdate>,
    /// The change log behind the cursor has expired; a fresh backfill is needed
    pub full_sync_required: bool,
}

impl ChangeSet {
    pub fn full_sync_required() -> Self {
        Self {
            full_sync_required: true,
            ..Self::default()
        }
    }
}

/// Uniform interface over one connected mailbox.
///
/// Every network method ensures token freshness first. `refresh_token` only
/// updates in-memory state; callers persist the returned pair.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Largest page size `list_threads` honours
    fn max_page_size(&self) -> usize;

    /// Whether the access token is within the refresh margin of expiry
    fn needs_refresh(&self) -> bool;

    /// The in-memory token pair, including any refresh done implicitly
    fn current_tokens(&self) -> TokenSet;

    async fn refresh_token(&self) -> Result<TokenSet, ProviderError>;

    async fn get_account_info(&self) -> Result<AccountInfo, ProviderError>;

    async fn list_threads(&self, options: &ListThreadsOptions) -> Result<ThreadPage, ProviderError>;

    async fn get_thread(&self, provider_thread_id: &str) -> Result<ProviderThread, ProviderError>;

    /// Read the change feed. An expired cursor is reported through
    /// [`ChangeSet::full_sync_required`], not as an error.
    async fn get_changes(&self, cursor: &str) -> Result<ChangeSet, ProviderError>;

    /// A cursor marking "now" in the change feed
    async fn get_initial_cursor(&self) -> Result<String, ProviderError>;
}
